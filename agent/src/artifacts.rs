use std::env;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use zip::ZipArchive;

use common::codec::MAX_BLOB_LENGTH;
use common::request::{KnownIds, PullKind, PullRequest};

use crate::error::ConfigError;
use crate::matcher::WildcardMatcher;
use crate::opt::Opt;
use crate::writer::Writer;

const MAX_ARCHIVE_NESTING: usize = 8;

/// Namespaces which belong to the platform or to well known frameworks.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "java/",
    "javax/",
    "jdk/",
    "sun/",
    "com/sun/",
    "org/springframework/",
    "kotlin/",
    "scala/"
];

/// Where the artifacts go.
pub trait ArtifactSink {
    fn send_file( &self, name: &str, contents: &[u8] ) -> io::Result< () >;
}

impl< W: Write > ArtifactSink for Writer< W > {
    fn send_file( &self, name: &str, contents: &[u8] ) -> io::Result< () > {
        Writer::send_file( self, name, contents )
    }
}

fn is_archive( name: &str ) -> bool {
    let name = name.to_ascii_lowercase();
    name.ends_with( ".jar" ) || name.ends_with( ".war" ) || name.ends_with( ".zip" )
}

/// The identifier the collector knows an artifact by.
///
/// Dumped classes are named `Name.<hex hash>.class`, and the hash is the identifier.
/// Anything else is identified by its relative path.
pub fn artifact_id( path: &str ) -> &str {
    let file_name = path.rsplit( '/' ).next().unwrap_or( path );
    let stem = match file_name.strip_suffix( ".class" ) {
        Some( stem ) => stem,
        None => return path
    };

    match stem.rsplit_once( '.' ) {
        Some( (name, hash) ) if !name.is_empty() && !hash.is_empty() && hash.bytes().all( |byte| byte.is_ascii_hexdigit() ) => hash,
        _ => path
    }
}

/// Reads at most one byte more than `limit`, so oversized inputs can be told apart.
fn read_capped< R: Read >( fp: R, limit: usize ) -> io::Result< Vec< u8 > > {
    let mut contents = Vec::new();
    fp.take( limit as u64 + 1 ).read_to_end( &mut contents )?;
    Ok( contents )
}

#[derive(Clone, Debug)]
pub struct ArtifactFilter {
    include: WildcardMatcher,
    exclude: WildcardMatcher
}

impl ArtifactFilter {
    pub fn new( includes: &str, excludes: &str ) -> Result< Self, ConfigError > {
        Ok( ArtifactFilter {
            include: WildcardMatcher::new( includes )?,
            exclude: WildcardMatcher::new( excludes )?
        })
    }

    pub fn accepts( &self, path: &str ) -> bool {
        self.include.matches( path ) && !self.exclude.matches( path )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct SyncStats {
    pub sent: usize,
    pub skipped_known: usize,
    pub filtered: usize
}

pub struct ArtifactSync {
    class_dump_dir: PathBuf,
    archive: Option< PathBuf >,
    filter: ArtifactFilter,
    denylist: Vec< String >,
    scratch_dir: PathBuf
}

impl ArtifactSync {
    pub fn new( class_dump_dir: PathBuf, archive: Option< PathBuf >, filter: ArtifactFilter ) -> Self {
        ArtifactSync {
            class_dump_dir,
            archive,
            filter,
            denylist: DEFAULT_DENYLIST.iter().map( |&prefix| prefix.to_owned() ).collect(),
            scratch_dir: env::temp_dir()
        }
    }

    pub fn from_opt( opt: &Opt ) -> Result< Self, ConfigError > {
        let filter = ArtifactFilter::new( &opt.includes, &opt.excludes )?;
        let mut sync = Self::new( opt.class_dump_dir.clone(), opt.archive.clone(), filter ).with_denylist( opt.denylist.clone() );
        if let Some( ref scratch_dir ) = opt.scratch_dir {
            sync = sync.with_scratch_dir( scratch_dir.clone() );
        }

        Ok( sync )
    }

    pub fn with_denylist( mut self, denylist: Vec< String > ) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn with_scratch_dir( mut self, scratch_dir: PathBuf ) -> Self {
        self.scratch_dir = scratch_dir;
        self
    }

    fn is_denied( &self, name: &str ) -> bool {
        self.denylist.iter().any( |prefix| name.starts_with( prefix.as_str() ) )
    }

    /// Sends every eligible artifact the collector doesn't know about yet.
    ///
    /// Only failures of the sink are returned; anything unreadable on the local
    /// side is logged and skipped.
    pub fn sync( &self, request: &PullRequest, sink: &dyn ArtifactSink ) -> io::Result< SyncStats > {
        let mut pass = Pass {
            sync: self,
            known: &request.known,
            sink,
            stats: SyncStats::default()
        };

        if request.kind == PullKind::Classes {
            if let Some( ref archive ) = self.archive {
                if archive.is_dir() {
                    pass.walk_directory( archive, archive )?;
                } else {
                    pass.walk_archive_file( archive )?;
                }
            }
        }

        if !self.class_dump_dir.exists() {
            if let Err( error ) = fs::create_dir_all( &self.class_dump_dir ) {
                warn!( "Failed to create {:?}: {}", self.class_dump_dir, error );
            }
        }

        pass.walk_directory( &self.class_dump_dir, &self.class_dump_dir )?;
        Ok( pass.stats )
    }
}

fn relative_path( root: &Path, path: &Path ) -> String {
    let relative = path.strip_prefix( root ).unwrap_or( path );
    let components: Vec< _ > = relative.components().map( |component| component.as_os_str().to_string_lossy() ).collect();
    components.join( "/" )
}

struct Pass< 'a > {
    sync: &'a ArtifactSync,
    known: &'a KnownIds,
    sink: &'a dyn ArtifactSink,
    stats: SyncStats
}

impl< 'a > Pass< 'a > {
    fn offer< F >( &mut self, path: &str, load: F ) -> io::Result< () > where F: FnOnce() -> io::Result< Vec< u8 > > {
        if !self.sync.filter.accepts( path ) {
            self.stats.filtered += 1;
            return Ok(());
        }

        if self.known.contains( artifact_id( path ) ) {
            self.stats.skipped_known += 1;
            return Ok(());
        }

        let contents = match load() {
            Ok( contents ) => contents,
            Err( error ) => {
                warn!( "Failed to read '{}': {}", path, error );
                return Ok(());
            }
        };

        if contents.is_empty() {
            return Ok(());
        }

        if contents.len() > MAX_BLOB_LENGTH {
            warn!( "Skipping '{}': {} bytes is too big to send", path, contents.len() );
            return Ok(());
        }

        trace!( "Sending '{}' ({} bytes)", path, contents.len() );
        self.sink.send_file( path, &contents )?;
        self.stats.sent += 1;
        Ok(())
    }

    fn walk_directory( &mut self, root: &Path, directory: &Path ) -> io::Result< () > {
        let mut paths: Vec< PathBuf > = match fs::read_dir( directory ) {
            Ok( entries ) => entries.filter_map( |entry| entry.ok() ).map( |entry| entry.path() ).collect(),
            Err( error ) => {
                warn!( "Failed to list {:?}: {}", directory, error );
                return Ok(());
            }
        };

        paths.sort();
        for path in paths {
            let metadata = match fs::symlink_metadata( &path ) {
                Ok( metadata ) => metadata,
                Err( error ) => {
                    warn!( "Failed to stat {:?}: {}", path, error );
                    continue;
                }
            };

            if metadata.is_dir() {
                self.walk_directory( root, &path )?;
                continue;
            }

            // Symlinks to files are followed, symlinks to directories aren't.
            let metadata = if metadata.file_type().is_symlink() {
                match fs::metadata( &path ) {
                    Ok( ref target ) if target.is_dir() => continue,
                    Ok( target ) => target,
                    Err( _ ) => continue
                }
            } else {
                metadata
            };

            if metadata.len() == 0 {
                continue;
            }

            let relative = relative_path( root, &path );
            if is_archive( &relative ) {
                self.walk_archive_file( &path )?;
                continue;
            }

            self.offer( &relative, || read_capped( File::open( &path )?, MAX_BLOB_LENGTH ) )?;
        }

        Ok(())
    }

    fn walk_archive_file( &mut self, path: &Path ) -> io::Result< () > {
        let fp = match File::open( path ) {
            Ok( fp ) => fp,
            Err( error ) => {
                warn!( "Failed to open archive {:?}: {}", path, error );
                return Ok(());
            }
        };

        self.walk_archive( fp, &path.display().to_string(), 0 )
    }

    fn walk_archive< R: Read + Seek >( &mut self, fp: R, label: &str, depth: usize ) -> io::Result< () > {
        let mut archive = match ZipArchive::new( fp ) {
            Ok( archive ) => archive,
            Err( error ) => {
                warn!( "Skipping unreadable archive {}: {}", label, error );
                return Ok(());
            }
        };

        debug!( "Walking archive {} ({} entries)", label, archive.len() );
        for index in 0..archive.len() {
            let mut entry = match archive.by_index( index ) {
                Ok( entry ) => entry,
                Err( error ) => {
                    warn!( "Skipping entry #{} of {}: {}", index, label, error );
                    continue;
                }
            };

            if entry.is_dir() {
                continue;
            }

            let name = entry.name().trim_start_matches( '/' ).to_owned();
            if self.sync.is_denied( &name ) {
                continue;
            }

            if is_archive( &name ) {
                if depth + 1 >= MAX_ARCHIVE_NESTING {
                    warn!( "Not descending into {}!/{}: archives are nested too deep", label, name );
                    continue;
                }

                let mut scratch = match NamedTempFile::new_in( &self.sync.scratch_dir ) {
                    Ok( scratch ) => scratch,
                    Err( error ) => {
                        warn!( "Not descending into {}!/{}: no scratch file in {:?}: {}", label, name, self.sync.scratch_dir, error );
                        continue;
                    }
                };

                if let Err( error ) = io::copy( &mut entry, &mut scratch ) {
                    warn!( "Failed to extract {}!/{}: {}", label, name, error );
                    continue;
                }

                drop( entry );
                if let Err( error ) = scratch.seek( SeekFrom::Start( 0 ) ) {
                    warn!( "Failed to rewind the scratch copy of {}!/{}: {}", label, name, error );
                    continue;
                }

                self.walk_archive( scratch.as_file_mut(), &format!( "{}!/{}", label, name ), depth + 1 )?;
                continue;
            }

            if entry.size() == 0 {
                continue;
            }

            self.offer( &name, move || read_capped( entry, MAX_BLOB_LENGTH ) )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::record::FileChunk;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    #[derive(Default)]
    struct Collected {
        files: Mutex< Vec< FileChunk > >
    }

    impl Collected {
        fn names( &self ) -> Vec< String > {
            self.files.lock().iter().map( |file| file.name.clone() ).collect()
        }
    }

    impl ArtifactSink for Collected {
        fn send_file( &self, name: &str, contents: &[u8] ) -> io::Result< () > {
            self.files.lock().push( FileChunk { name: name.to_owned(), contents: contents.to_vec() } );
            Ok(())
        }
    }

    struct FailingSink;
    impl ArtifactSink for FailingSink {
        fn send_file( &self, _: &str, _: &[u8] ) -> io::Result< () > {
            Err( io::Error::new( io::ErrorKind::BrokenPipe, "gone" ) )
        }
    }

    fn build_zip( entries: &[(&str, &[u8])] ) -> Vec< u8 > {
        let mut writer = ZipWriter::new( Cursor::new( Vec::new() ) );
        let options = SimpleFileOptions::default().compression_method( CompressionMethod::Deflated );
        for &(name, contents) in entries {
            if name.ends_with( '/' ) {
                writer.add_directory( name, options ).unwrap();
            } else {
                writer.start_file( name, options ).unwrap();
                writer.write_all( contents ).unwrap();
            }
        }

        writer.finish().unwrap().into_inner()
    }

    fn put( root: &Path, relative: &str, contents: &[u8] ) {
        let path = root.join( relative );
        fs::create_dir_all( path.parent().unwrap() ).unwrap();
        fs::write( path, contents ).unwrap();
    }

    fn pull( kind: PullKind, known: &str ) -> PullRequest {
        PullRequest { kind, known: KnownIds::parse( known ) }
    }

    fn sync_for( dump_dir: &Path, archive: Option< PathBuf >, includes: &str, excludes: &str ) -> ArtifactSync {
        ArtifactSync::new( dump_dir.to_owned(), archive, ArtifactFilter::new( includes, excludes ).unwrap() )
    }

    #[test]
    fn test_artifact_id() {
        assert_eq!( artifact_id( "com/example/Foo.3f2a9c.class" ), "3f2a9c" );
        assert_eq!( artifact_id( "Foo.a.b.class" ), "b" );
        assert_eq!( artifact_id( "com/example/Foo.class" ), "com/example/Foo.class" );
        assert_eq!( artifact_id( "README" ), "README" );
        assert_eq!( artifact_id( "com/ex.ample/Foo.class" ), "com/ex.ample/Foo.class" );
    }

    #[test]
    fn test_only_hashed_class_names_share_an_identifier() {
        assert_eq!( artifact_id( "static/app.min.js" ), "static/app.min.js" );
        assert_eq!( artifact_id( "static/vendor.min.js" ), "static/vendor.min.js" );
        assert_eq!( artifact_id( "META-INF/beans.spring.xml" ), "META-INF/beans.spring.xml" );
        assert_eq!( artifact_id( "com/app/Foo.notahash.class" ), "com/app/Foo.notahash.class" );
        assert_eq!( artifact_id( "com/app/.abc.class" ), "com/app/.abc.class" );
        assert_eq!( artifact_id( "com/app/Foo.ABC123.class" ), "ABC123" );
    }

    #[test]
    fn test_resources_with_a_common_suffix_are_not_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        put( dir.path(), "static/app.min.js", b"app" );
        put( dir.path(), "static/vendor.min.js", b"vendor" );

        let sync = sync_for( dir.path(), None, "*", "" );
        let sink = Collected::default();
        let stats = sync.sync( &pull( PullKind::Classes, "static/app.min.js" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "static/vendor.min.js" ] );
        assert_eq!( stats.skipped_known, 1 );
    }

    #[test]
    fn test_read_capped() {
        assert_eq!( read_capped( Cursor::new( b"abcd".to_vec() ), 4 ).unwrap(), b"abcd" );
        assert_eq!( read_capped( Cursor::new( b"abcdefgh".to_vec() ), 4 ).unwrap(), b"abcde" );
        assert_eq!( read_capped( Cursor::new( Vec::new() ), 4 ).unwrap(), b"" );
    }

    #[test]
    fn test_from_opt_uses_the_configured_denylist() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join( "app.jar" );
        fs::write( &archive, build_zip( &[
            ("java/lang/Object.class", b"platform"),
            ("org/acme/Anvil.class", b"anvil")
        ])).unwrap();

        let opt = Opt {
            class_dump_dir: dir.path().join( "dump" ),
            archive: Some( archive ),
            denylist: vec![ "org/acme/".into() ],
            .. Opt::default()
        };

        let sync = ArtifactSync::from_opt( &opt ).unwrap();
        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "java/lang/Object.class" ] );
    }

    #[test]
    fn test_unusable_scratch_dir_skips_only_nested_archives() {
        let inner = build_zip( &[ ("com/lib/Inner.class", b"inner") ] );
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join( "app.war" );
        fs::write( &archive, build_zip( &[
            ("WEB-INF/lib/inner.jar", &inner),
            ("com/app/Outer.class", b"outer")
        ])).unwrap();

        let sync = sync_for( &dir.path().join( "dump" ), Some( archive ), "*", "" )
            .with_scratch_dir( dir.path().join( "no/such/dir" ) );

        let sink = Collected::default();
        let stats = sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "com/app/Outer.class" ] );
        assert_eq!( stats.sent, 1 );
    }

    #[test]
    fn test_filter() {
        let filter = ArtifactFilter::new( "a/*", "a/b*" ).unwrap();
        assert!( filter.accepts( "a/c/X.class" ) );
        assert!( filter.accepts( "a/X.class" ) );
        assert!( !filter.accepts( "a/b/X.class" ) );
        assert!( !filter.accepts( "a/bc.class" ) );
        assert!( !filter.accepts( "z/X.class" ) );
    }

    #[test]
    fn test_directory_sync_filters_and_skips_known() {
        let dir = tempfile::tempdir().unwrap();
        put( dir.path(), "a/c/X.111.class", b"x" );
        put( dir.path(), "a/c/Y.222.class", b"y" );
        put( dir.path(), "a/b/Z.333.class", b"z" );
        put( dir.path(), "a/c/Empty.444.class", b"" );
        put( dir.path(), "q/W.555.class", b"w" );

        let sync = sync_for( dir.path(), None, "a/*", "a/b*" );
        let sink = Collected::default();
        let stats = sync.sync( &pull( PullKind::Classes, "222|999" ), &sink ).unwrap();

        assert_eq!( sink.names(), vec![ "a/c/X.111.class".to_owned() ] );
        assert_eq!( sink.files.lock()[ 0 ].contents, b"x" );
        assert_eq!( stats, SyncStats { sent: 1, skipped_known: 1, filtered: 2 } );
    }

    #[test]
    fn test_empty_known_list_sends_everything_in_order() {
        let dir = tempfile::tempdir().unwrap();
        put( dir.path(), "b/B.2.class", b"b" );
        put( dir.path(), "a/A.1.class", b"a" );
        put( dir.path(), "a/Z.3.class", b"z" );

        let sync = sync_for( dir.path(), None, "*", "" );
        let sink = Collected::default();
        sync.sync( &pull( PullKind::RunningClasses, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "a/A.1.class", "a/Z.3.class", "b/B.2.class" ] );
    }

    #[test]
    fn test_missing_dump_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let dump_dir = dir.path().join( "not/there/yet" );
        let sync = sync_for( &dump_dir, None, "*", "" );
        let sink = Collected::default();
        let stats = sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( stats, SyncStats::default() );
        assert!( dump_dir.is_dir() );
    }

    #[test]
    fn test_archive_is_only_walked_for_a_full_pull() {
        let dir = tempfile::tempdir().unwrap();
        let dump_dir = dir.path().join( "dump" );
        put( &dump_dir, "com/app/Running.abc.class", b"running" );

        let archive = dir.path().join( "app.jar" );
        fs::write( &archive, build_zip( &[
            ("META-INF/", b""),
            ("com/app/Packaged.class", b"packaged"),
            ("com/app/Empty.class", b""),
            ("java/lang/Object.class", b"platform")
        ])).unwrap();

        let sync = sync_for( &dump_dir, Some( archive ), "*", "" );

        let sink = Collected::default();
        sync.sync( &pull( PullKind::RunningClasses, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "com/app/Running.abc.class" ] );

        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "com/app/Packaged.class", "com/app/Running.abc.class" ] );
        assert_eq!( sink.files.lock()[ 0 ].contents, b"packaged" );

        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "com/app/Packaged.class|abc" ), &sink ).unwrap();
        assert!( sink.names().is_empty() );
    }

    #[test]
    fn test_nested_archives() {
        let innermost = build_zip( &[ ("com/lib/Deep.class", b"deep") ] );
        let inner = build_zip( &[
            ("com/lib/Inner.class", b"inner"),
            ("nested/innermost.jar", &innermost)
        ]);
        let outer = build_zip( &[
            ("BOOT-INF/lib/inner.jar", &inner),
            ("BOOT-INF/lib/broken.jar", b"this is not a zip file"),
            ("com/app/Outer.class", b"outer")
        ]);

        let dir = tempfile::tempdir().unwrap();
        let dump_dir = dir.path().join( "dump" );
        put( &dump_dir, "libs/outer.war", &outer );

        let sync = sync_for( &dump_dir, None, "com/*", "" );
        let sink = Collected::default();
        let stats = sync.sync( &pull( PullKind::RunningClasses, "" ), &sink ).unwrap();

        let mut names = sink.names();
        names.sort();
        assert_eq!( names, vec![ "com/app/Outer.class", "com/lib/Deep.class", "com/lib/Inner.class" ] );
        assert_eq!( stats.sent, 3 );
    }

    #[test]
    fn test_denylist() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join( "app.zip" );
        fs::write( &archive, build_zip( &[
            ("org/springframework/Bean.class", b"bean"),
            ("org/acme/Anvil.class", b"anvil")
        ])).unwrap();

        let sync = sync_for( &dir.path().join( "dump" ), Some( archive.clone() ), "*", "" );
        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "org/acme/Anvil.class" ] );

        let sync = sync_for( &dir.path().join( "dump" ), Some( archive ), "*", "" ).with_denylist( vec![ "org/acme/".into() ] );
        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "org/springframework/Bean.class" ] );
    }

    #[test]
    fn test_sink_errors_are_propagated() {
        let dir = tempfile::tempdir().unwrap();
        put( dir.path(), "A.1.class", b"a" );
        let sync = sync_for( dir.path(), None, "*", "" );
        let error = sync.sync( &pull( PullKind::Classes, "" ), &FailingSink ).unwrap_err();
        assert_eq!( error.kind(), io::ErrorKind::BrokenPipe );
    }

    #[test]
    fn test_missing_archive_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        put( &dir.path().join( "dump" ), "A.1.class", b"a" );
        let sync = sync_for( &dir.path().join( "dump" ), Some( dir.path().join( "missing.jar" ) ), "*", "" );
        let sink = Collected::default();
        sync.sync( &pull( PullKind::Classes, "" ), &sink ).unwrap();
        assert_eq!( sink.names(), vec![ "A.1.class" ] );
    }
}
