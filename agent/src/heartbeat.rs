use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::signal::StopSignal;

/// Time of the last successful send on a connection.
pub struct HeartbeatClock {
    origin: Instant,
    last: AtomicU64
}

impl HeartbeatClock {
    pub fn new() -> Self {
        HeartbeatClock {
            origin: Instant::now(),
            last: AtomicU64::new( 0 )
        }
    }

    fn now( &self ) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Records outbound traffic. Concurrent callers can't move the clock backwards.
    pub fn touch( &self ) {
        self.last.fetch_max( self.now(), Ordering::SeqCst );
    }

    pub fn elapsed( &self ) -> Duration {
        let last = self.last.load( Ordering::SeqCst );
        Duration::from_millis( self.now().saturating_sub( last ) )
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What the monitor keeps alive.
pub trait Keepalive: Send + Sync + 'static {
    fn clock( &self ) -> &HeartbeatClock;
    fn is_closed( &self ) -> bool;
    fn send_heartbeat( &self ) -> io::Result< () >;
}

pub struct HeartbeatMonitor {
    stop: Arc< StopSignal >,
    handle: Option< thread::JoinHandle< () > >
}

fn monitor_main< K: Keepalive >( target: &K, interval: Duration, stop: &StopSignal ) {
    debug!( "Heartbeat thread started" );
    while !target.is_closed() {
        let elapsed = target.clock().elapsed();
        let timeout = if elapsed >= interval {
            trace!( "Idle for {}ms; sending a heartbeat", elapsed.as_millis() );
            if let Err( error ) = target.send_heartbeat() {
                debug!( "Failed to send a heartbeat: {}", error );
                break;
            }

            interval
        } else {
            interval - elapsed
        };

        if stop.wait_timeout( timeout ) {
            break;
        }
    }

    debug!( "Heartbeat thread stopped" );
}

impl HeartbeatMonitor {
    pub fn start< K: Keepalive >( target: Arc< K >, interval: Duration ) -> io::Result< Self > {
        let stop = Arc::new( StopSignal::new() );
        let handle = {
            let stop = stop.clone();
            thread::Builder::new().name( "covstream-heartbeat".into() ).spawn( move || {
                monitor_main( &*target, interval, &stop );
            })?
        };

        Ok( HeartbeatMonitor {
            stop,
            handle: Some( handle )
        })
    }

    /// Wakes the monitor up if it's sleeping and waits for it to exit.
    pub fn stop( &mut self ) {
        self.stop.raise();
        if let Some( handle ) = self.handle.take() {
            if handle.join().is_err() {
                warn!( "The heartbeat thread panicked" );
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop( &mut self ) {
        self.stop();
    }
}
