use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common::record::ProjectInfo;

use crate::artifacts::DEFAULT_DENYLIST;
use crate::cycle::BackoffPolicy;
use crate::error::ConfigError;
use crate::matcher::WildcardMatcher;

pub const DEFAULT_PORT: u16 = 6300;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs( 60 );
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs( 10 );

#[derive(Clone, Debug)]
pub struct Opt {
    pub address: String,
    pub port: u16,

    pub product: String,
    pub project: String,
    pub service: String,
    pub branch: String,
    pub commit: String,
    pub git_url: String,

    /// Where the instrumentation dumps the classes it has seen.
    pub class_dump_dir: PathBuf,
    /// The application archive, if the classes are also available packaged.
    pub archive: Option< PathBuf >,

    pub includes: String,
    pub excludes: String,
    /// Namespace prefixes of archive entries which are never sent.
    pub denylist: Vec< String >,
    /// Where nested archives are unpacked; the system temporary directory if unset.
    pub scratch_dir: Option< PathBuf >,

    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            address: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            product: String::new(),
            project: String::new(),
            service: String::new(),
            branch: String::new(),
            commit: String::new(),
            git_url: String::new(),
            class_dump_dir: PathBuf::new(),
            archive: None,
            includes: "*".into(),
            excludes: String::new(),
            denylist: DEFAULT_DENYLIST.iter().map( |&prefix| prefix.to_owned() ).collect(),
            scratch_dir: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default()
        }
    }
}

fn parse_number< T: FromStr >( name: &'static str, value: String ) -> Result< T, ConfigError > {
    value.trim().parse().map_err( |_| ConfigError::InvalidNumber { name, value } )
}

fn parse_millis( name: &'static str, value: String ) -> Result< Duration, ConfigError > {
    parse_number::< u64 >( name, value ).map( Duration::from_millis )
}

impl Opt {
    /// Reads the `COVSTREAM_*` environment variables on top of the defaults.
    pub fn from_env() -> Result< Self, ConfigError > {
        Self::from_vars( |name| env::var( name ).ok() )
    }

    pub fn from_vars< F >( lookup: F ) -> Result< Self, ConfigError > where F: Fn( &str ) -> Option< String > {
        let mut opt = Opt::default();
        let var = |name: &str| lookup( name ).filter( |value| !value.is_empty() );

        if let Some( value ) = var( "COVSTREAM_ADDRESS" ) {
            opt.address = value;
        }
        if let Some( value ) = var( "COVSTREAM_PORT" ) {
            opt.port = parse_number( "COVSTREAM_PORT", value )?;
        }

        macro_rules! string {
            ($field:ident, $name:expr) => {
                if let Some( value ) = var( $name ) {
                    opt.$field = value;
                }
            }
        }

        string!( product, "COVSTREAM_PRODUCT" );
        string!( project, "COVSTREAM_PROJECT" );
        string!( service, "COVSTREAM_SERVICE" );
        string!( branch, "COVSTREAM_BRANCH" );
        string!( commit, "COVSTREAM_COMMIT" );
        string!( git_url, "COVSTREAM_GIT_URL" );
        string!( includes, "COVSTREAM_INCLUDES" );
        string!( excludes, "COVSTREAM_EXCLUDES" );

        if let Some( value ) = var( "COVSTREAM_CLASS_DUMP_DIR" ) {
            opt.class_dump_dir = value.into();
        }
        opt.archive = var( "COVSTREAM_ARCHIVE" ).map( PathBuf::from );
        opt.scratch_dir = var( "COVSTREAM_SCRATCH_DIR" ).map( PathBuf::from );

        if let Some( value ) = var( "COVSTREAM_DENYLIST" ) {
            opt.denylist = value.split( ':' ).filter( |prefix| !prefix.is_empty() ).map( |prefix| prefix.to_owned() ).collect();
        }

        if let Some( value ) = var( "COVSTREAM_HEARTBEAT_INTERVAL_MS" ) {
            opt.heartbeat_interval = parse_millis( "COVSTREAM_HEARTBEAT_INTERVAL_MS", value )?;
        }
        if let Some( value ) = var( "COVSTREAM_CONNECT_TIMEOUT_MS" ) {
            opt.connect_timeout = parse_millis( "COVSTREAM_CONNECT_TIMEOUT_MS", value )?;
        }
        if let Some( value ) = var( "COVSTREAM_RETRY_DELAY_MS" ) {
            opt.backoff.base = parse_millis( "COVSTREAM_RETRY_DELAY_MS", value )?;
        }
        if let Some( value ) = var( "COVSTREAM_MAX_RETRY_DELAY_MS" ) {
            opt.backoff.cap = parse_millis( "COVSTREAM_MAX_RETRY_DELAY_MS", value )?;
        }

        Ok( opt )
    }

    /// Checks everything that would otherwise only blow up once the agent is running.
    pub fn validate( &self ) -> Result< (), ConfigError > {
        if self.product.is_empty() {
            return Err( ConfigError::Missing( "product" ) );
        }

        if self.class_dump_dir.as_os_str().is_empty() {
            return Err( ConfigError::Missing( "class_dump_dir" ) );
        }

        if self.address.is_empty() || self.port == 0 {
            return Err( ConfigError::InvalidAddress( format!( "{}:{}", self.address, self.port ) ) );
        }

        let fields = [
            ("product", &self.product),
            ("project", &self.project),
            ("service", &self.service),
            ("branch", &self.branch),
            ("commit", &self.commit),
            ("git_url", &self.git_url)
        ];

        for &(name, value) in &fields {
            if value.contains( '|' ) {
                return Err( ConfigError::InvalidProjectField { name, value: value.clone() } );
            }
        }

        WildcardMatcher::new( &self.includes )?;
        WildcardMatcher::new( &self.excludes )?;

        if self.heartbeat_interval == Duration::from_secs( 0 ) {
            return Err( ConfigError::InvalidNumber { name: "heartbeat_interval", value: "0".into() } );
        }

        if self.connect_timeout == Duration::from_secs( 0 ) {
            return Err( ConfigError::InvalidNumber { name: "connect_timeout", value: "0".into() } );
        }

        Ok(())
    }

    pub fn project_info( &self ) -> ProjectInfo {
        ProjectInfo {
            product: self.product.clone(),
            project: self.project.clone(),
            service: self.service.clone(),
            branch: self.branch.clone(),
            commit: self.commit.clone(),
            git_url: self.git_url.clone()
        }
    }

    pub fn log( &self ) {
        info!( "Collector: {}:{}", self.address, self.port );
        info!( "Project: {}/{} (service: '{}', branch: '{}', commit: '{}')", self.product, self.project, self.service, self.branch, self.commit );
        info!( "Class dump directory: {:?}", self.class_dump_dir );
        if let Some( ref archive ) = self.archive {
            info!( "Application archive: {:?}", archive );
        }
        info!( "Includes: '{}', excludes: '{}'", self.includes, self.excludes );
        info!( "Denied archive namespaces: '{}'", self.denylist.join( ":" ) );
        if let Some( ref scratch_dir ) = self.scratch_dir {
            info!( "Scratch directory: {:?}", scratch_dir );
        }
        info!( "Heartbeat interval: {}ms", self.heartbeat_interval.as_millis() );
        info!( "Retry delay: {}ms, capped at {}ms", self.backoff.base.as_millis(), self.backoff.cap.as_millis() );
    }
}
