use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use common::record::ProjectInfo;

use crate::artifacts::ArtifactSync;
use crate::connection::Connection;
use crate::data::ExecutionDataSource;
use crate::heartbeat::HeartbeatMonitor;
use crate::signal::StopSignal;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs( 5 );
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs( 90 );

/// How long to wait before the next connection attempt.
///
/// Early retries use the base delay; after 30 consecutive failures the delay
/// grows by one base step every 10 failures, and from 100 failures on it stays
/// at the cap. No delay ever exceeds the cap.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: DEFAULT_RETRY_DELAY,
            cap: DEFAULT_MAX_RETRY_DELAY
        }
    }
}

impl BackoffPolicy {
    pub fn delay( &self, failures: u32 ) -> Duration {
        let delay = if failures < 30 {
            self.base
        } else if failures < 100 {
            self.base.checked_mul( 2 + (failures - 30) / 10 ).unwrap_or( self.cap )
        } else {
            self.cap
        };

        delay.min( self.cap )
    }
}

/// Opens the sockets to the collector.
pub trait Connector: Send + Sync + 'static {
    fn connect( &self ) -> io::Result< TcpStream >;
}

impl< F > Connector for F where F: Fn() -> io::Result< TcpStream > + Send + Sync + 'static {
    fn connect( &self ) -> io::Result< TcpStream > {
        self()
    }
}

pub struct TcpConnector {
    address: String,
    port: u16,
    timeout: Duration
}

impl TcpConnector {
    pub fn new( address: String, port: u16, timeout: Duration ) -> Self {
        TcpConnector { address, port, timeout }
    }
}

impl Connector for TcpConnector {
    fn connect( &self ) -> io::Result< TcpStream > {
        let mut last_error = None;
        for address in (self.address.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout( &address, self.timeout ) {
                Ok( socket ) => {
                    socket.set_nodelay( true )?;
                    return Ok( socket );
                },
                Err( error ) => last_error = Some( error )
            }
        }

        Err( last_error.unwrap_or_else( || {
            io::Error::new( io::ErrorKind::NotFound, format!( "'{}' doesn't resolve to any address", self.address ) )
        }))
    }
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_STOPPED: u8 = 3;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CycleState {
    Disconnected,
    Connecting,
    Connected,
    Stopped
}

#[derive(Clone, Debug)]
pub struct CycleSettings {
    pub project: ProjectInfo,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy
}

/// The connection the cycle is working with; only dumped into once `ready`.
#[derive(Default)]
struct Link {
    connection: Option< Arc< Connection > >,
    ready: bool
}

struct Shared {
    running: AtomicBool,
    state: AtomicU8,
    stop: StopSignal,
    current: Mutex< Link >
}

impl Shared {
    fn set_state( &self, state: u8 ) {
        self.state.store( state, Ordering::SeqCst );
    }

    fn is_running( &self ) -> bool {
        self.running.load( Ordering::SeqCst )
    }
}

struct Worker {
    shared: Arc< Shared >,
    connector: Arc< dyn Connector >,
    data: Arc< dyn ExecutionDataSource >,
    artifacts: Arc< ArtifactSync >,
    settings: CycleSettings
}

impl Worker {
    fn run( &self ) {
        let mut failures: u32 = 0;
        let mut attempt: u64 = 0;
        while self.shared.is_running() {
            attempt += 1;
            self.shared.set_state( STATE_CONNECTING );
            match self.session( &mut failures ) {
                Ok( true ) => info!( "Disconnected from the collector" ),
                Ok( false ) => {},
                Err( error ) => {
                    if self.shared.is_running() {
                        info!( "Connection attempt #{} to the collector failed: {}", attempt, error );
                    }
                }
            }

            if !self.shared.is_running() {
                break;
            }

            self.shared.set_state( STATE_DISCONNECTED );
            let delay = self.settings.backoff.delay( failures );
            failures = failures.saturating_add( 1 );
            info!( "Reconnecting in {}ms (attempt #{})...", delay.as_millis(), attempt + 1 );
            if self.shared.stop.wait_timeout( delay ) {
                break;
            }
        }

        self.shared.set_state( STATE_STOPPED );
        debug!( "Cycle thread stopped" );
    }

    /// Returns whether the handshake went through.
    fn session( &self, failures: &mut u32 ) -> io::Result< bool > {
        let socket = self.connector.connect()?;
        let mut connection = Connection::new( socket, self.data.clone(), self.artifacts.clone() );
        connection.init()?;
        let connection = Arc::new( connection );

        {
            let mut current = self.shared.current.lock();
            if !self.shared.is_running() {
                connection.close();
                return Ok( false );
            }

            *current = Link { connection: Some( connection.clone() ), ready: false };
        }

        let result = self.drive( &connection, failures );
        connection.close();
        *self.shared.current.lock() = Link::default();
        result
    }

    fn drive( &self, connection: &Arc< Connection >, failures: &mut u32 ) -> io::Result< bool > {
        connection.send_project_info( &self.settings.project )?;
        *failures = 0;

        {
            let mut current = self.shared.current.lock();
            if !self.shared.is_running() {
                return Ok( false );
            }

            current.ready = true;
            self.shared.set_state( STATE_CONNECTED );
        }

        info!( "Connected to the collector" );

        let mut monitor = HeartbeatMonitor::start( connection.clone(), self.settings.heartbeat_interval )?;
        let result = connection.run();
        connection.close();
        monitor.stop();

        result.map( |_| true )
    }
}

/// Keeps a connection to the collector open, reconnecting as needed, on its own thread.
pub struct CycleOutput {
    shared: Arc< Shared >,
    handle: Option< thread::JoinHandle< () > >
}

impl CycleOutput {
    pub fn startup(
        connector: Arc< dyn Connector >,
        data: Arc< dyn ExecutionDataSource >,
        artifacts: Arc< ArtifactSync >,
        settings: CycleSettings
    ) -> io::Result< Self > {
        let shared = Arc::new( Shared {
            running: AtomicBool::new( true ),
            state: AtomicU8::new( STATE_DISCONNECTED ),
            stop: StopSignal::new(),
            current: Mutex::new( Link::default() )
        });

        let worker = Worker {
            shared: shared.clone(),
            connector,
            data,
            artifacts,
            settings
        };

        let handle = thread::Builder::new().name( "covstream-cycle".into() ).spawn( move || {
            worker.run();
        })?;

        Ok( CycleOutput {
            shared,
            handle: Some( handle )
        })
    }

    pub fn state( &self ) -> CycleState {
        match self.shared.state.load( Ordering::SeqCst ) {
            STATE_DISCONNECTED => CycleState::Disconnected,
            STATE_CONNECTING => CycleState::Connecting,
            STATE_CONNECTED => CycleState::Connected,
            _ => CycleState::Stopped
        }
    }

    /// Dumps over the current connection, if there is one and its handshake went through.
    pub fn write_execution_data( &self, reset: bool ) -> io::Result< () > {
        let current = {
            let current = self.shared.current.lock();
            if current.ready { current.connection.clone() } else { None }
        };

        match current {
            Some( connection ) => connection.write_execution_data( reset ),
            None => Ok(())
        }
    }

    /// Stops reconnecting, closes the current connection and waits for the cycle thread.
    pub fn shutdown( &mut self ) {
        let handle = match self.handle.take() {
            Some( handle ) => handle,
            None => return
        };

        self.shared.running.store( false, Ordering::SeqCst );
        self.shared.stop.raise();
        if let Some( ref connection ) = self.shared.current.lock().connection {
            connection.close();
        }

        if handle.join().is_err() {
            warn!( "The cycle thread panicked" );
        }

        self.shared.set_state( STATE_STOPPED );
    }
}

impl Drop for CycleOutput {
    fn drop( &mut self ) {
        self.shutdown();
    }
}
