use std::io::{self, ErrorKind};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::session::{client_loop, CollectorConfig};
use crate::util::{ReadableDuration, Sigint};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis( 100 );

/// Accepts agents until Ctrl-C is pressed, serving each on its own thread.
pub fn serve( listener: TcpListener, config: Arc< CollectorConfig >, sigint: Sigint ) -> io::Result< () > {
    listener.set_nonblocking( true )?;
    info!( "Listening on {}...", listener.local_addr()? );

    let mut handles: Vec< thread::JoinHandle< () > > = Vec::new();
    while !sigint.was_sent() {
        let (socket, address) = match listener.accept() {
            Ok( value ) => value,
            Err( ref error ) if error.kind() == ErrorKind::WouldBlock || error.kind() == ErrorKind::Interrupted => {
                thread::sleep( ACCEPT_POLL_INTERVAL );
                continue;
            },
            Err( error ) => return Err( error )
        };

        socket.set_nonblocking( false )?;
        socket.set_nodelay( true )?;
        info!( "Agent connected from {}", address );

        let config = config.clone();
        let sigint = sigint.clone();
        let handle = thread::Builder::new().name( format!( "covstream-agent-{}", address ) ).spawn( move || {
            let start = Instant::now();
            match client_loop( socket, &config, sigint ) {
                Ok( summary ) => info!(
                    "Agent {} disconnected after {}; {} file(s) and {} execution data record(s) received",
                    address,
                    ReadableDuration( start.elapsed().as_secs() ),
                    summary.files,
                    summary.exec_records
                ),
                Err( error ) => error!( "Dropped agent {}: {}", address, error )
            }
        })?;

        handles.push( handle );
        handles.retain( |handle| !handle.is_finished() );
    }

    info!( "Waiting for {} agent thread(s) to finish...", handles.len() );
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
