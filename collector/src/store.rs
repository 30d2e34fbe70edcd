use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};

use common::codec::DataOutput;
use common::record::{ProjectInfo, Record};
use common::request::KnownIds;
use covstream_agent::artifact_id;

use crate::util::sanitize_component;

/// The output directory; everything is filed under `<product>/<project>`.
pub struct Store {
    root: PathBuf
}

impl Store {
    pub fn new< P: Into< PathBuf > >( root: P ) -> Self {
        Store { root: root.into() }
    }

    pub fn project( &self, info: &ProjectInfo ) -> io::Result< ProjectStore > {
        let directory = self.root
            .join( sanitize_component( &info.product ) )
            .join( sanitize_component( &info.project ) );

        fs::create_dir_all( directory.join( "classes" ) )?;
        Ok( ProjectStore { directory } )
    }
}

pub struct ProjectStore {
    directory: PathBuf
}

fn invalid_name( name: &str ) -> io::Error {
    io::Error::new( io::ErrorKind::InvalidInput, format!( "refusing to store a file named '{}'", name ) )
}

/// Maps an agent supplied relative path to a path under `root`.
fn resolve( root: &Path, name: &str ) -> io::Result< PathBuf > {
    let relative = Path::new( name );
    let mut path = root.to_owned();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal( part ) => {
                path.push( part );
                depth += 1;
            },
            Component::CurDir => {},
            _ => return Err( invalid_name( name ) )
        }
    }

    if depth == 0 {
        return Err( invalid_name( name ) );
    }

    Ok( path )
}

fn collect_ids( root: &Path, directory: &Path, known: &mut KnownIds ) -> io::Result< () > {
    for entry in fs::read_dir( directory )? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_ids( root, &path, known )?;
            continue;
        }

        if let Ok( relative ) = path.strip_prefix( root ) {
            let components: Vec< _ > = relative.components().map( |component| component.as_os_str().to_string_lossy() ).collect();
            let relative = components.join( "/" );
            known.insert( artifact_id( &relative ) );
        }
    }

    Ok(())
}

impl ProjectStore {
    pub fn directory( &self ) -> &Path {
        &self.directory
    }

    pub fn classes_dir( &self ) -> PathBuf {
        self.directory.join( "classes" )
    }

    /// Identifiers of every artifact stored so far.
    pub fn known_ids( &self ) -> io::Result< KnownIds > {
        let mut known = KnownIds::new();
        let classes = self.classes_dir();
        collect_ids( &classes, &classes, &mut known )?;
        Ok( known )
    }

    pub fn save_file( &self, name: &str, contents: &[u8] ) -> io::Result< PathBuf > {
        let path = resolve( &self.classes_dir(), name )?;
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent )?;
        }

        fs::write( &path, contents )?;
        Ok( path )
    }

    pub fn create_exec_file( &self, label: &str ) -> io::Result< ExecFile > {
        ExecFile::create( self.directory.join( format!( "{}.exec", sanitize_component( label ) ) ) )
    }
}

/// A standalone execution data file: a header followed by session and class records.
pub struct ExecFile {
    path: PathBuf,
    output: DataOutput< BufWriter< File > >,
    records: usize
}

impl ExecFile {
    pub fn create( path: PathBuf ) -> io::Result< Self > {
        let fp = File::create( &path )?;
        let mut output = DataOutput::new( BufWriter::new( fp ) );
        Record::header().write_to( &mut output )?;
        Ok( ExecFile {
            path,
            output,
            records: 0
        })
    }

    pub fn path( &self ) -> &Path {
        &self.path
    }

    pub fn records( &self ) -> usize {
        self.records
    }

    /// Only session and class records belong in an exec file; anything else is ignored.
    pub fn append( &mut self, record: &Record ) -> io::Result< () > {
        match record {
            Record::SessionInfo( .. ) | Record::ExecutionData( .. ) => {
                record.write_to( &mut self.output )?;
                self.records += 1;
            },
            _ => {}
        }

        Ok(())
    }

    pub fn flush( &mut self ) -> io::Result< () > {
        self.output.flush()
    }
}

impl Drop for ExecFile {
    fn drop( &mut self ) {
        if let Err( error ) = self.output.flush() {
            warn!( "Failed to flush {:?}: {}", self.path, error );
        }
    }
}
