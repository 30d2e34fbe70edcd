use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

fn level_to_str( level: Level ) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WRN",
        Level::Info => "INF",
        Level::Debug => "DBG",
        Level::Trace => "TRC"
    }
}

fn gettid() -> libc::pid_t {
    unsafe { libc::syscall( libc::SYS_gettid ) as libc::pid_t }
}

fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

fn filter( record: &Record ) -> bool {
    match record.module_path() {
        Some( module ) => !module.starts_with( "zip::" ),
        None => true
    }
}

pub struct StderrLogger {
    level: LevelFilter,
    pid: libc::pid_t
}

impl StderrLogger {
    pub fn new( level: LevelFilter ) -> Self {
        StderrLogger {
            level,
            pid: getpid()
        }
    }
}

impl Log for StderrLogger {
    #[inline]
    fn enabled( &self, metadata: &Metadata ) -> bool {
        metadata.level() <= self.level
    }

    fn log( &self, record: &Record ) {
        if !self.enabled( record.metadata() ) || !filter( record ) {
            return;
        }

        let stderr = io::stderr();
        let mut stderr = stderr.lock();
        let _ = writeln!( stderr, "covstream: {:04x} {:04x} {} {}", self.pid, gettid(), level_to_str( record.level() ), record.args() );
    }

    fn flush( &self ) {}
}

struct FileOutput {
    fp: File,
    path: PathBuf,
    old_path: PathBuf,
    bytes_written: u64
}

impl FileOutput {
    fn rotate( &mut self ) -> io::Result< () > {
        fs::rename( &self.path, &self.old_path )?;
        self.fp = File::create( &self.path )?;
        self.bytes_written = 0;
        Ok(())
    }
}

/// Appends to a file, moving it to `<path>.old` once it grows past the threshold.
pub struct FileLogger {
    level: LevelFilter,
    pid: libc::pid_t,
    rotate_at: Option< u64 >,
    output: Mutex< FileOutput >
}

impl FileLogger {
    pub fn new( path: PathBuf, rotate_at: Option< u64 >, level: LevelFilter ) -> io::Result< Self > {
        let fp = OpenOptions::new().create( true ).append( true ).open( &path )?;
        let bytes_written = fp.metadata()?.len();
        let mut old_path = path.clone().into_os_string();
        old_path.push( ".old" );

        Ok( FileLogger {
            level,
            pid: getpid(),
            rotate_at: rotate_at.filter( |&threshold| threshold != 0 ),
            output: Mutex::new( FileOutput {
                fp,
                path,
                old_path: old_path.into(),
                bytes_written
            })
        })
    }
}

impl Log for FileLogger {
    #[inline]
    fn enabled( &self, metadata: &Metadata ) -> bool {
        metadata.level() <= self.level
    }

    fn log( &self, record: &Record ) {
        if !self.enabled( record.metadata() ) || !filter( record ) {
            return;
        }

        let line = format!( "{:04x} {:04x} {} {}\n", self.pid, gettid(), level_to_str( record.level() ), record.args() );
        let mut output = self.output.lock();
        if output.fp.write_all( line.as_bytes() ).is_ok() {
            output.bytes_written += line.len() as u64;
        }

        if let Some( threshold ) = self.rotate_at {
            if output.bytes_written >= threshold {
                if let Err( error ) = output.rotate() {
                    let _ = writeln!( io::stderr(), "covstream: failed to rotate the log file: {}", error );
                }
            }
        }
    }

    fn flush( &self ) {
        let _ = self.output.lock().fp.flush();
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub path: Option< PathBuf >,
    pub rotate_at: Option< u64 >
}

impl LogSettings {
    pub fn from_vars< F >( lookup: F ) -> Self where F: Fn( &str ) -> Option< String > {
        let level = match lookup( "COVSTREAM_LOG" ).as_ref().map( |value| value.as_str() ) {
            Some( "trace" ) => LevelFilter::Trace,
            Some( "debug" ) => LevelFilter::Debug,
            Some( "info" ) => LevelFilter::Info,
            Some( "warn" ) => LevelFilter::Warn,
            Some( "error" ) => LevelFilter::Error,
            _ => LevelFilter::Off
        };

        LogSettings {
            level,
            path: lookup( "COVSTREAM_LOGFILE" ).filter( |value| !value.is_empty() ).map( PathBuf::from ),
            rotate_at: lookup( "COVSTREAM_LOGFILE_ROTATE_WHEN_BIGGER_THAN" ).and_then( |value| value.trim().parse().ok() )
        }
    }
}

/// Installs the agent's logger once per process, unless the host already has one.
pub fn initialize_logger() {
    static ONCE: Once = Once::new();
    ONCE.call_once( || {
        let settings = LogSettings::from_vars( |name| env::var( name ).ok() );
        if settings.level == LevelFilter::Off {
            return;
        }

        let logger: Box< dyn Log > = match settings.path {
            Some( ref path ) => match FileLogger::new( path.clone(), settings.rotate_at, settings.level ) {
                Ok( logger ) => Box::new( logger ),
                Err( error ) => {
                    let _ = writeln!( io::stderr(), "covstream: failed to open {:?}: {}", path, error );
                    Box::new( StderrLogger::new( settings.level ) )
                }
            },
            None => Box::new( StderrLogger::new( settings.level ) )
        };

        if log::set_boxed_logger( logger ).is_ok() {
            log::set_max_level( settings.level );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn log_line( logger: &dyn Log, level: Level, message: &str ) {
        logger.log( &Record::builder()
            .args( format_args!( "{}", message ) )
            .level( level )
            .module_path( Some( "covstream_agent::tests" ) )
            .build()
        );
    }

    #[test]
    fn test_settings_from_vars() {
        let vars: HashMap< &str, &str > = [
            ("COVSTREAM_LOG", "debug"),
            ("COVSTREAM_LOGFILE", "/tmp/agent.log"),
            ("COVSTREAM_LOGFILE_ROTATE_WHEN_BIGGER_THAN", "4096")
        ].iter().cloned().collect();

        let settings = LogSettings::from_vars( |name| vars.get( name ).map( |value| value.to_string() ) );
        assert_eq!( settings.level, LevelFilter::Debug );
        assert_eq!( settings.path, Some( PathBuf::from( "/tmp/agent.log" ) ) );
        assert_eq!( settings.rotate_at, Some( 4096 ) );

        let settings = LogSettings::from_vars( |_| None );
        assert_eq!( settings, LogSettings { level: LevelFilter::Off, path: None, rotate_at: None } );
    }

    #[test]
    fn test_file_logger_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "agent.log" );
        let logger = FileLogger::new( path.clone(), None, LevelFilter::Info ).unwrap();
        log_line( &logger, Level::Info, "connected" );
        log_line( &logger, Level::Debug, "noise" );
        logger.flush();

        let contents = fs::read_to_string( &path ).unwrap();
        assert!( contents.contains( "INF connected" ) );
        assert!( !contents.contains( "noise" ) );
    }

    #[test]
    fn test_file_logger_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "agent.log" );
        let logger = FileLogger::new( path.clone(), Some( 64 ), LevelFilter::Trace ).unwrap();
        for index in 0..10 {
            log_line( &logger, Level::Warn, &format!( "line number {}", index ) );
        }
        logger.flush();

        let old = fs::read_to_string( dir.path().join( "agent.log.old" ) ).unwrap();
        let current = fs::read_to_string( &path ).unwrap();
        assert!( !old.is_empty() );
        assert!( current.len() < 64 );
        assert!( current.contains( "line number 9" ) || old.contains( "line number 9" ) );
    }
}
