use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use common::record::ProjectInfo;
use common::request::PullRequest;

use crate::artifacts::ArtifactSync;
use crate::data::ExecutionDataSource;
use crate::heartbeat::{HeartbeatClock, Keepalive};
use crate::reader::{CommandVisitor, Reader};
use crate::writer::Writer;

const STATE_UNBOUND: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Unbound,
    Initialized,
    Running,
    Closed
}

impl ConnectionState {
    fn from_raw( raw: u8 ) -> Self {
        match raw {
            STATE_UNBOUND => ConnectionState::Unbound,
            STATE_INITIALIZED => ConnectionState::Initialized,
            STATE_RUNNING => ConnectionState::Running,
            _ => ConnectionState::Closed
        }
    }
}

/// A single session with the collector over one socket.
pub struct Connection {
    socket: TcpStream,
    state: AtomicU8,
    data: Arc< dyn ExecutionDataSource >,
    artifacts: Arc< ArtifactSync >,
    clock: Arc< HeartbeatClock >,
    writer: Option< Writer< TcpStream > >,
    reader: Mutex< Option< Reader< TcpStream > > >
}

fn not_connected() -> io::Error {
    io::Error::new( io::ErrorKind::NotConnected, "connection is not initialized" )
}

impl Connection {
    pub fn new( socket: TcpStream, data: Arc< dyn ExecutionDataSource >, artifacts: Arc< ArtifactSync > ) -> Self {
        Connection {
            socket,
            state: AtomicU8::new( STATE_UNBOUND ),
            data,
            artifacts,
            clock: Arc::new( HeartbeatClock::new() ),
            writer: None,
            reader: Mutex::new( None )
        }
    }

    /// Binds the writer and the reader to the socket; the writer sends the stream header right away.
    pub fn init( &mut self ) -> io::Result< () > {
        if self.state() != ConnectionState::Unbound {
            return Err( io::Error::new( io::ErrorKind::Other, "connection was already initialized" ) );
        }

        let writer = Writer::new( self.socket.try_clone()?, self.clock.clone() )?;
        let reader = Reader::new( self.socket.try_clone()? );
        self.writer = Some( writer );
        *self.reader.lock() = Some( reader );
        self.state.store( STATE_INITIALIZED, Ordering::SeqCst );
        Ok(())
    }

    pub fn state( &self ) -> ConnectionState {
        ConnectionState::from_raw( self.state.load( Ordering::SeqCst ) )
    }

    pub fn is_closed( &self ) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn writer( &self ) -> io::Result< &Writer< TcpStream > > {
        self.writer.as_ref().ok_or_else( not_connected )
    }

    /// Processes the collector's requests until the stream ends or the connection is closed.
    ///
    /// Errors caused by a deliberate `close` are not reported. The connection is always
    /// closed once this returns.
    pub fn run( &self ) -> io::Result< () > {
        let reader = self.reader.lock().take();
        let mut reader = match reader {
            Some( reader ) => reader,
            None => return Err( not_connected() )
        };

        if self.state.compare_exchange( STATE_INITIALIZED, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst ).is_err() {
            return Ok(());
        }

        let mut commands = Commands { connection: self };
        let result = loop {
            match reader.read( &mut commands ) {
                Ok( true ) => continue,
                Ok( false ) => break Ok(()),
                Err( error ) => break Err( error )
            }
        };

        let result = match result {
            Err( error ) if self.is_closed() => {
                debug!( "Read loop interrupted by a close: {}", error );
                Ok(())
            },
            result => result
        };

        self.close();
        result
    }

    /// Dumps the execution data on the caller's thread; does nothing unless initialized and open.
    pub fn write_execution_data( &self, reset: bool ) -> io::Result< () > {
        match self.state() {
            ConnectionState::Initialized | ConnectionState::Running => self.dump( true, reset ),
            _ => Ok(())
        }
    }

    pub fn send_project_info( &self, info: &ProjectInfo ) -> io::Result< () > {
        self.writer()?.send_project_info( info )
    }

    pub fn close( &self ) {
        if self.state.swap( STATE_CLOSED, Ordering::SeqCst ) == STATE_CLOSED {
            return;
        }

        if let Err( error ) = self.socket.shutdown( Shutdown::Both ) {
            if error.kind() != io::ErrorKind::NotConnected {
                debug!( "Failed to shut down the socket: {}", error );
            }
        }
    }

    fn dump( &self, dump: bool, reset: bool ) -> io::Result< () > {
        let writer = self.writer()?;
        if dump {
            let mut visitor = writer;
            self.data.collect( &mut visitor, reset )?;
        } else if reset {
            self.data.reset();
        }

        writer.send_cmd_ok()
    }

    fn pull( &self, request: &PullRequest ) -> io::Result< () > {
        let writer = self.writer()?;
        let stats = self.artifacts.sync( request, writer )?;
        info!(
            "Artifact sync ({:?}): {} sent, {} already known, {} filtered out",
            request.kind,
            stats.sent,
            stats.skipped_known,
            stats.filtered
        );

        writer.send_cmd_ok()
    }
}

impl Keepalive for Connection {
    fn clock( &self ) -> &HeartbeatClock {
        &self.clock
    }

    fn is_closed( &self ) -> bool {
        Connection::is_closed( self )
    }

    fn send_heartbeat( &self ) -> io::Result< () > {
        self.writer()?.send_heartbeat()
    }
}

struct Commands< 'a > {
    connection: &'a Connection
}

impl< 'a > CommandVisitor for Commands< 'a > {
    fn visit_dump( &mut self, dump: bool, reset: bool ) -> io::Result< () > {
        self.connection.dump( dump, reset )
    }

    fn visit_pull( &mut self, request: PullRequest ) -> io::Result< () > {
        self.connection.pull( &request )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactFilter;
    use crate::data::RuntimeData;
    use common::record::{FileChunk, Record, RecordReader};
    use common::request::{KnownIds, PullKind};
    use std::fs;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        _dump_dir: tempfile::TempDir,
        connection: Arc< Connection >,
        data: Arc< RuntimeData >,
        peer: TcpStream
    }

    fn fixture() -> Fixture {
        let listener = TcpListener::bind( "127.0.0.1:0" ).unwrap();
        let socket = TcpStream::connect( listener.local_addr().unwrap() ).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_read_timeout( Some( Duration::from_secs( 10 ) ) ).unwrap();

        let dump_dir = tempfile::tempdir().unwrap();
        fs::write( dump_dir.path().join( "Foo.f00.class" ), b"foo" ).unwrap();
        fs::write( dump_dir.path().join( "Bar.ba7.class" ), b"bar" ).unwrap();

        let data = Arc::new( RuntimeData::new( "session" ) );
        data.probes( 1, "Foo", 2 ).hit( 1 );
        data.probes( 2, "Bar", 2 );

        let artifacts = ArtifactSync::new( dump_dir.path().to_owned(), None, ArtifactFilter::new( "*", "" ).unwrap() );
        let mut connection = Connection::new( socket, data.clone(), Arc::new( artifacts ) );
        connection.init().unwrap();

        Fixture {
            _dump_dir: dump_dir,
            connection: Arc::new( connection ),
            data,
            peer
        }
    }

    fn run_in_background( connection: &Arc< Connection > ) -> thread::JoinHandle< io::Result< () > > {
        let connection = connection.clone();
        thread::spawn( move || connection.run() )
    }

    fn next( reader: &mut RecordReader< TcpStream > ) -> Record {
        reader.read_record().unwrap().unwrap()
    }

    #[test]
    fn test_commands_are_answered() {
        let fixture = fixture();
        let handle = run_in_background( &fixture.connection );

        let mut from_agent = RecordReader::new( fixture.peer.try_clone().unwrap() );
        assert_eq!( next( &mut from_agent ), Record::header() );

        let to_agent = Writer::new( fixture.peer.try_clone().unwrap(), Arc::new( HeartbeatClock::new() ) ).unwrap();
        to_agent.send_dump_command( true, false ).unwrap();

        match next( &mut from_agent ) {
            Record::SessionInfo( info ) => assert_eq!( info.id, "session" ),
            record => panic!( "unexpected record: {:?}", record )
        }
        match next( &mut from_agent ) {
            Record::ExecutionData( data ) => assert_eq!( data.name, "Foo" ),
            record => panic!( "unexpected record: {:?}", record )
        }
        assert_eq!( next( &mut from_agent ), Record::CmdOk );

        to_agent.send_pull( PullKind::Classes, KnownIds::parse( "ba7" ) ).unwrap();
        assert_eq!( next( &mut from_agent ), Record::File( FileChunk { name: "Foo.f00.class".into(), contents: b"foo".to_vec() } ) );
        assert_eq!( next( &mut from_agent ), Record::CmdOk );

        to_agent.send_dump_command( false, true ).unwrap();
        assert_eq!( next( &mut from_agent ), Record::CmdOk );
        assert!( !fixture.data.probes( 1, "Foo", 2 ).snapshot()[ 1 ] );

        fixture.peer.shutdown( Shutdown::Both ).unwrap();
        handle.join().unwrap().unwrap();
        assert!( fixture.connection.is_closed() );
    }

    #[test]
    fn test_close_unblocks_run() {
        let fixture = fixture();
        let handle = run_in_background( &fixture.connection );
        thread::sleep( Duration::from_millis( 50 ) );

        fixture.connection.close();
        fixture.connection.close();
        handle.join().unwrap().unwrap();
        assert_eq!( fixture.connection.state(), ConnectionState::Closed );
    }

    #[test]
    fn test_cmd_ok_ends_the_session() {
        let fixture = fixture();
        let handle = run_in_background( &fixture.connection );
        let to_agent = Writer::new( fixture.peer.try_clone().unwrap(), Arc::new( HeartbeatClock::new() ) ).unwrap();
        to_agent.send_cmd_ok().unwrap();
        handle.join().unwrap().unwrap();
        assert!( fixture.connection.is_closed() );
    }

    #[test]
    fn test_protocol_violation_is_an_error() {
        let fixture = fixture();
        let handle = run_in_background( &fixture.connection );
        {
            use std::io::Write;
            let mut peer = fixture.peer.try_clone().unwrap();
            peer.write_all( &common::record::file_header() ).unwrap();
            peer.write_all( &[ 0x7F ] ).unwrap();
        }

        assert_eq!( handle.join().unwrap().unwrap_err().kind(), io::ErrorKind::InvalidData );
        assert!( fixture.connection.is_closed() );
    }

    #[test]
    fn test_write_execution_data_only_while_open() {
        let fixture = fixture();
        fixture.connection.write_execution_data( false ).unwrap();

        let mut from_agent = RecordReader::new( fixture.peer.try_clone().unwrap() );
        assert_eq!( next( &mut from_agent ), Record::header() );
        assert!( matches!( next( &mut from_agent ), Record::SessionInfo( .. ) ) );
        assert!( matches!( next( &mut from_agent ), Record::ExecutionData( .. ) ) );
        assert_eq!( next( &mut from_agent ), Record::CmdOk );

        fixture.connection.close();
        fixture.connection.write_execution_data( false ).unwrap();
        assert!( from_agent.read_record().unwrap().is_none() );
    }

    #[test]
    fn test_unbound_connection_is_inert() {
        let listener = TcpListener::bind( "127.0.0.1:0" ).unwrap();
        let socket = TcpStream::connect( listener.local_addr().unwrap() ).unwrap();
        let artifacts = ArtifactSync::new( "/nonexistent".into(), None, ArtifactFilter::new( "*", "" ).unwrap() );
        let connection = Connection::new( socket, Arc::new( RuntimeData::new( "s" ) ), Arc::new( artifacts ) );

        assert_eq!( connection.state(), ConnectionState::Unbound );
        connection.write_execution_data( true ).unwrap();
        assert_eq!( connection.run().unwrap_err().kind(), io::ErrorKind::NotConnected );
        assert!( connection.send_project_info( &ProjectInfo::default() ).is_err() );
    }
}
