use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use common::record::{ProjectInfo, Record, RecordReader};
use common::request::PullKind;
use covstream_agent::{HeartbeatClock, StopSignal, Writer};

use crate::store::{ExecFile, ProjectStore, Store};
use crate::util::Sigint;

const POLL_INTERVAL: Duration = Duration::from_millis( 200 );

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub output: PathBuf,
    /// How often to ask the agents for a dump; `None` disables periodic dumps.
    pub dump_interval: Option< Duration >,
    pub reset: bool,
    pub pull: bool,
    /// Agents which stay silent for longer than this are dropped.
    pub heartbeat_timeout: Duration
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            output: PathBuf::from( "covstream-data" ),
            dump_interval: Some( Duration::from_secs( 60 ) ),
            reset: false,
            pull: true,
            heartbeat_timeout: Duration::from_secs( 180 )
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionSummary {
    pub project: Option< ProjectInfo >,
    pub files: usize,
    pub exec_records: usize,
    pub exec_path: Option< PathBuf >
}

struct Wrapper {
    sigint: Sigint,
    stream: TcpStream,
    last_activity: Instant,
    timeout: Duration
}

impl Read for Wrapper {
    fn read( &mut self, buffer: &mut [u8] ) -> io::Result< usize > {
        loop {
            if self.sigint.was_sent() {
                return Err( io::Error::new( ErrorKind::ConnectionAborted, "interrupted by SIGINT" ) );
            }

            match self.stream.read( buffer ) {
                Err( ref error ) if error.kind() == ErrorKind::WouldBlock || error.kind() == ErrorKind::TimedOut => {
                    if self.last_activity.elapsed() >= self.timeout {
                        return Err( io::Error::new( ErrorKind::TimedOut, "the agent went silent" ) );
                    }

                    continue;
                },
                Ok( count ) => {
                    self.last_activity = Instant::now();
                    return Ok( count );
                },
                result => return result
            }
        }
    }
}

struct DumpTimer {
    stop: Arc< StopSignal >,
    handle: Option< thread::JoinHandle< () > >
}

impl DumpTimer {
    fn start( writer: Arc< Writer< TcpStream > >, interval: Duration, reset: bool ) -> io::Result< Self > {
        let stop = Arc::new( StopSignal::new() );
        let handle = {
            let stop = stop.clone();
            thread::Builder::new().name( "covstream-dump".into() ).spawn( move || {
                while !stop.wait_timeout( interval ) {
                    debug!( "Requesting a dump (reset: {})", reset );
                    if let Err( error ) = writer.send_dump_command( true, reset ) {
                        debug!( "Failed to request a dump: {}", error );
                        break;
                    }
                }
            })?
        };

        Ok( DumpTimer {
            stop,
            handle: Some( handle )
        })
    }
}

impl Drop for DumpTimer {
    fn drop( &mut self ) {
        self.stop.raise();
        if let Some( handle ) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Session< 'a > {
    address: SocketAddr,
    config: &'a CollectorConfig,
    store: Store,
    writer: Arc< Writer< TcpStream > >,
    project: Option< ProjectStore >,
    exec: Option< ExecFile >,
    timer: Option< DumpTimer >,
    summary: SessionSummary
}

impl< 'a > Session< 'a > {
    fn handle( &mut self, record: Record ) -> io::Result< () > {
        match record {
            Record::Header { version } => {
                debug!( "Agent {} speaks format version 0x{:04X}", self.address, version );
            },
            Record::ProjectInfo( info ) => self.handshake( info )?,
            Record::Heartbeat => {
                trace!( "Heartbeat from {}", self.address );
            },
            Record::File( file ) => {
                let project = match self.project {
                    Some( ref project ) => project,
                    None => {
                        warn!( "Agent {} sent '{}' before its project info; ignoring", self.address, file.name );
                        return Ok(());
                    }
                };

                match project.save_file( &file.name, &file.contents ) {
                    Ok( path ) => {
                        debug!( "Stored {:?} ({} bytes)", path, file.contents.len() );
                        self.summary.files += 1;
                    },
                    Err( error ) => warn!( "Failed to store '{}' from {}: {}", file.name, self.address, error )
                }
            },
            record @ Record::SessionInfo( .. ) | record @ Record::ExecutionData( .. ) => {
                if self.exec.is_none() {
                    let project = match self.project {
                        Some( ref project ) => project,
                        None => {
                            warn!( "Agent {} sent execution data before its project info; ignoring", self.address );
                            return Ok(());
                        }
                    };

                    let label = format!( "{}_{}", Local::now().format( "%Y%m%d_%H%M%S" ), self.address.port() );
                    let exec = project.create_exec_file( &label )?;
                    info!( "Writing execution data from {} to {:?}", self.address, exec.path() );
                    self.summary.exec_path = Some( exec.path().to_owned() );
                    self.exec = Some( exec );
                }

                if let Some( ref mut exec ) = self.exec {
                    exec.append( &record )?;
                    self.summary.exec_records += 1;
                }
            },
            Record::CmdOk => {
                debug!( "Agent {} acknowledged a command", self.address );
                if let Some( ref mut exec ) = self.exec {
                    exec.flush()?;
                }
            },
            Record::CmdDump { .. } | Record::Pull( .. ) => {
                warn!( "Agent {} sent a command block; ignoring", self.address );
            }
        }

        Ok(())
    }

    fn handshake( &mut self, info: ProjectInfo ) -> io::Result< () > {
        if self.project.is_some() {
            warn!( "Agent {} sent its project info twice; ignoring", self.address );
            return Ok(());
        }

        info!( "Agent {} belongs to {}/{}:", self.address, info.product, info.project );
        info!( "   Service: {}", info.service );
        info!( "    Branch: {}", info.branch );
        info!( "    Commit: {}", info.commit );
        info!( "   Git URL: {}", info.git_url );

        let project = self.store.project( &info )?;
        if self.config.pull {
            let known = project.known_ids()?;
            info!( "Pulling classes from {} ({} already known)", self.address, known.len() );
            self.writer.send_pull( PullKind::Classes, known )?;
        }

        if let Some( interval ) = self.config.dump_interval {
            self.timer = Some( DumpTimer::start( self.writer.clone(), interval, self.config.reset )? );
        }

        self.project = Some( project );
        self.summary.project = Some( info );
        Ok(())
    }
}

/// Serves a single agent until it disconnects, goes silent, or Ctrl-C is pressed.
pub fn client_loop( socket: TcpStream, config: &CollectorConfig, sigint: Sigint ) -> io::Result< SessionSummary > {
    let address = socket.peer_addr()?;
    socket.set_read_timeout( Some( POLL_INTERVAL.min( config.heartbeat_timeout ) ) )?;

    let writer = Arc::new( Writer::new( socket.try_clone()?, Arc::new( HeartbeatClock::new() ) )? );
    let mut reader = RecordReader::new( Wrapper {
        sigint: sigint.clone(),
        stream: socket,
        last_activity: Instant::now(),
        timeout: config.heartbeat_timeout
    });

    let mut session = Session {
        address,
        config,
        store: Store::new( config.output.clone() ),
        writer,
        project: None,
        exec: None,
        timer: None,
        summary: SessionSummary::default()
    };

    let result = loop {
        let record = match reader.read_record() {
            Ok( Some( record ) ) => record,
            Ok( None ) => break Ok(()),
            Err( ref error ) if error.kind() == ErrorKind::UnexpectedEof || sigint.was_sent() => break Ok(()),
            Err( error ) => break Err( error )
        };

        if let Err( error ) = session.handle( record ) {
            break Err( error );
        }
    };

    session.timer = None;
    session.exec = None;
    result.map( |_| session.summary )
}
