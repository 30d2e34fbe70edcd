#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod artifacts;
mod connection;
mod cycle;
mod data;
mod error;
mod heartbeat;
mod logger;
mod matcher;
mod opt;
mod reader;
mod signal;
mod writer;

use std::io;
use std::sync::Arc;

pub use crate::artifacts::{artifact_id, ArtifactFilter, ArtifactSink, ArtifactSync, SyncStats, DEFAULT_DENYLIST};
pub use crate::connection::{Connection, ConnectionState};
pub use crate::cycle::{BackoffPolicy, Connector, CycleOutput, CycleSettings, CycleState, TcpConnector};
pub use crate::data::{ExecutionDataSource, ExecutionDataVisitor, ProbeArray, RuntimeData};
pub use crate::error::ConfigError;
pub use crate::heartbeat::{HeartbeatClock, HeartbeatMonitor, Keepalive};
pub use crate::logger::{initialize_logger, LogSettings};
pub use crate::matcher::WildcardMatcher;
pub use crate::opt::Opt;
pub use crate::reader::{CommandVisitor, Reader};
pub use crate::signal::StopSignal;
pub use crate::writer::Writer;

/// The agent as seen by the host process.
pub struct Agent {
    output: CycleOutput
}

impl Agent {
    /// Validates the settings and starts connecting to the collector in the background.
    pub fn startup( opt: Opt, data: Arc< dyn ExecutionDataSource > ) -> Result< Agent, ConfigError > {
        let connector = TcpConnector::new( opt.address.clone(), opt.port, opt.connect_timeout );
        Self::startup_with_connector( opt, data, Arc::new( connector ) )
    }

    pub fn startup_with_connector( opt: Opt, data: Arc< dyn ExecutionDataSource >, connector: Arc< dyn Connector > ) -> Result< Agent, ConfigError > {
        initialize_logger();

        if let Err( error ) = opt.validate() {
            error!( "Invalid configuration: {}", error );
            return Err( error );
        }

        opt.log();
        let artifacts = ArtifactSync::from_opt( &opt )?;
        let settings = CycleSettings {
            project: opt.project_info(),
            heartbeat_interval: opt.heartbeat_interval,
            backoff: opt.backoff
        };

        let output = CycleOutput::startup( connector, data, Arc::new( artifacts ), settings )
            .map_err( |error| ConfigError::Startup( error.to_string() ) )?;

        info!( "Agent started" );
        Ok( Agent { output } )
    }

    pub fn state( &self ) -> CycleState {
        self.output.state()
    }

    /// Dumps the execution data to the collector, if one is connected.
    pub fn write_execution_data( &self, reset: bool ) -> io::Result< () > {
        self.output.write_execution_data( reset )
    }

    pub fn shutdown( mut self ) {
        self.output.shutdown();
        info!( "Agent stopped" );
    }
}
