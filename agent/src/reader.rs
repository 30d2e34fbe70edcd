use std::io::{self, Read};

use common::record::{read_known_ids, Record, RecordReader};
use common::request::{
    PullKind,
    PullRequest,
    BLOCK_CMD_DUMP,
    BLOCK_CMD_OK,
    BLOCK_PULL_CLASSES,
    BLOCK_PULL_RUNNING_CLASSES
};

/// Receives whatever the collector asks for.
pub trait CommandVisitor {
    fn visit_dump( &mut self, dump: bool, reset: bool ) -> io::Result< () >;
    fn visit_pull( &mut self, request: PullRequest ) -> io::Result< () >;

    /// Plain data records; the collector has no business sending these, so they're only logged.
    fn visit_record( &mut self, record: Record ) -> io::Result< () > {
        trace!( "Ignoring a 0x{:02X} block from the collector", record.tag() );
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Flow {
    Continue,
    Stop
}

type Handler< R > = fn( &mut RecordReader< R >, u8, &mut dyn CommandVisitor ) -> io::Result< Flow >;

fn read_dump_command< R: Read >( input: &mut RecordReader< R >, _: u8, visitor: &mut dyn CommandVisitor ) -> io::Result< Flow > {
    let dump = input.input().read_bool()?;
    let reset = input.input().read_bool()?;
    debug!( "Received a dump command (dump: {}, reset: {})", dump, reset );
    visitor.visit_dump( dump, reset )?;
    Ok( Flow::Continue )
}

fn read_pull_command< R: Read >( input: &mut RecordReader< R >, tag: u8, visitor: &mut dyn CommandVisitor ) -> io::Result< Flow > {
    let kind = match PullKind::from_tag( tag ) {
        Some( kind ) => kind,
        None => unreachable!()
    };

    let known = read_known_ids( input.input() )?;
    debug!( "Received a pull request ({:?}) with {} known artifact(s)", kind, known.len() );
    visitor.visit_pull( PullRequest { kind, known } )?;
    Ok( Flow::Continue )
}

fn read_cmd_ok< R: Read >( _: &mut RecordReader< R >, _: u8, _: &mut dyn CommandVisitor ) -> io::Result< Flow > {
    debug!( "Received an acknowledgement from the collector" );
    Ok( Flow::Stop )
}

fn read_base_record< R: Read >( input: &mut RecordReader< R >, tag: u8, visitor: &mut dyn CommandVisitor ) -> io::Result< Flow > {
    let record = input.read_body( tag )?;
    visitor.visit_record( record )?;
    Ok( Flow::Continue )
}

/// Parses the collector's side of the stream.
///
/// Command blocks are looked up in a table; anything else falls through to the
/// plain record decoder, which rejects tags it doesn't know.
pub struct Reader< R: Read > {
    input: RecordReader< R >,
    handlers: Vec< (u8, Handler< R >) >,
    default_handler: Handler< R >
}

impl< R: Read > Reader< R > {
    pub fn new( fp: R ) -> Self {
        let handlers: Vec< (u8, Handler< R >) > = vec![
            (BLOCK_CMD_DUMP, read_dump_command),
            (BLOCK_PULL_CLASSES, read_pull_command),
            (BLOCK_PULL_RUNNING_CLASSES, read_pull_command),
            (BLOCK_CMD_OK, read_cmd_ok)
        ];

        Reader {
            input: RecordReader::new( fp ),
            handlers,
            default_handler: read_base_record
        }
    }

    fn handler( &self, tag: u8 ) -> Handler< R > {
        self.handlers.iter()
            .find( |&&(handler_tag, _)| handler_tag == tag )
            .map( |&(_, handler)| handler )
            .unwrap_or( self.default_handler )
    }

    /// Processes a single block; returns `false` once the stream is over.
    pub fn read( &mut self, visitor: &mut dyn CommandVisitor ) -> io::Result< bool > {
        let tag = match self.input.next_tag()? {
            Some( tag ) => tag,
            None => return Ok( false )
        };

        let handler = self.handler( tag );
        let flow = handler( &mut self.input, tag, visitor )?;
        Ok( flow == Flow::Continue )
    }
}
