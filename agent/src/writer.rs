use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use common::codec::DataOutput;
use common::record::{ExecutionData, FileChunk, ProjectInfo, Record, SessionInfo};
use common::request::{KnownIds, PullKind, PullRequest};

use crate::data::ExecutionDataVisitor;
use crate::heartbeat::HeartbeatClock;

/// Serializes records onto a stream shared by several threads.
///
/// Every record is encoded up front and then written out in one go under the stream
/// lock, so records from different senders never interleave. Every successful send
/// touches the heartbeat clock.
pub struct Writer< W: Write > {
    output: Mutex< DataOutput< W > >,
    clock: Arc< HeartbeatClock >
}

impl< W: Write > Writer< W > {
    /// Wraps the stream and writes the header.
    pub fn new( fp: W, clock: Arc< HeartbeatClock > ) -> io::Result< Self > {
        let writer = Writer {
            output: Mutex::new( DataOutput::new( fp ) ),
            clock
        };

        writer.send( &Record::header() )?;
        Ok( writer )
    }

    pub fn clock( &self ) -> &HeartbeatClock {
        &self.clock
    }

    /// Runs `callback` on the underlying stream while holding the lock.
    pub fn with_inner< R, F: FnOnce( &mut W ) -> R >( &self, callback: F ) -> R {
        let mut output = self.output.lock();
        callback( output.inner_mut() )
    }

    fn send( &self, record: &Record ) -> io::Result< () > {
        let bytes = record.encode()?;
        {
            let mut output = self.output.lock();
            let fp = output.inner_mut();
            fp.write_all( &bytes )?;
            fp.flush()?;
        }

        self.clock.touch();
        Ok(())
    }

    pub fn send_session_info( &self, info: &SessionInfo ) -> io::Result< () > {
        self.send( &Record::SessionInfo( info.clone() ) )
    }

    /// Returns `false` without writing anything if none of the probes were hit.
    pub fn send_execution_data( &self, data: &ExecutionData ) -> io::Result< bool > {
        if !data.has_hits() {
            return Ok( false );
        }

        self.send( &Record::ExecutionData( data.clone() ) )?;
        Ok( true )
    }

    pub fn send_heartbeat( &self ) -> io::Result< () > {
        self.send( &Record::Heartbeat )
    }

    /// Empty files carry nothing worth sending and are skipped.
    pub fn send_file( &self, name: &str, contents: &[u8] ) -> io::Result< () > {
        if contents.is_empty() {
            return Ok(());
        }

        self.send( &Record::File( FileChunk {
            name: name.to_owned(),
            contents: contents.to_vec()
        }))
    }

    pub fn send_project_info( &self, info: &ProjectInfo ) -> io::Result< () > {
        self.send( &Record::ProjectInfo( info.clone() ) )
    }

    pub fn send_cmd_ok( &self ) -> io::Result< () > {
        self.send( &Record::CmdOk )
    }

    pub fn send_dump_command( &self, dump: bool, reset: bool ) -> io::Result< () > {
        self.send( &Record::CmdDump { dump, reset } )
    }

    pub fn send_pull( &self, kind: PullKind, known: KnownIds ) -> io::Result< () > {
        self.send( &Record::Pull( PullRequest { kind, known } ) )
    }
}

impl< 'a, W: Write > ExecutionDataVisitor for &'a Writer< W > {
    fn visit_session_info( &mut self, info: &SessionInfo ) -> io::Result< () > {
        self.send_session_info( info )
    }

    fn visit_class_execution( &mut self, data: &ExecutionData ) -> io::Result< () > {
        self.send_execution_data( data ).map( |_| () )
    }
}
