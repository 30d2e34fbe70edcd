use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use common::Timestamp;
use common::record::{ExecutionData, SessionInfo};

/// Receives a snapshot of the collected execution data.
pub trait ExecutionDataVisitor {
    fn visit_session_info( &mut self, info: &SessionInfo ) -> io::Result< () >;
    fn visit_class_execution( &mut self, data: &ExecutionData ) -> io::Result< () >;
}

/// Whatever holds the probes of the instrumented program.
pub trait ExecutionDataSource: Send + Sync {
    fn session_id( &self ) -> String;

    /// Emits one session info followed by the data of every known class.
    fn collect( &self, visitor: &mut dyn ExecutionDataVisitor, reset: bool ) -> io::Result< () >;

    fn reset( &self );
}

/// Probes of a single class; the instrumented code flips them without taking any locks.
pub struct ProbeArray {
    probes: Box< [AtomicBool] >
}

impl ProbeArray {
    fn new( count: usize ) -> Self {
        ProbeArray {
            probes: (0..count).map( |_| AtomicBool::new( false ) ).collect()
        }
    }

    #[inline]
    pub fn hit( &self, index: usize ) {
        if let Some( probe ) = self.probes.get( index ) {
            probe.store( true, Ordering::Relaxed );
        }
    }

    pub fn len( &self ) -> usize {
        self.probes.len()
    }

    pub fn is_empty( &self ) -> bool {
        self.probes.is_empty()
    }

    pub fn snapshot( &self ) -> Vec< bool > {
        self.probes.iter().map( |probe| probe.load( Ordering::Relaxed ) ).collect()
    }

    fn reset( &self ) {
        for probe in self.probes.iter() {
            probe.store( false, Ordering::Relaxed );
        }
    }
}

struct ClassEntry {
    name: String,
    probes: Arc< ProbeArray >
}

struct Session {
    id: String,
    start: Timestamp
}

/// In-memory registry of every instrumented class, keyed by class id.
pub struct RuntimeData {
    session: Mutex< Session >,
    classes: Mutex< BTreeMap< i64, ClassEntry > >
}

impl RuntimeData {
    pub fn new< S: Into< String > >( session_id: S ) -> Self {
        RuntimeData {
            session: Mutex::new( Session {
                id: session_id.into(),
                start: Timestamp::now()
            }),
            classes: Mutex::new( BTreeMap::new() )
        }
    }

    pub fn set_session_id< S: Into< String > >( &self, session_id: S ) {
        self.session.lock().id = session_id.into();
    }

    /// Returns the probes of the given class, registering it on first use.
    pub fn probes( &self, id: i64, name: &str, probe_count: usize ) -> Arc< ProbeArray > {
        let mut classes = self.classes.lock();
        let entry = classes.entry( id ).or_insert_with( || ClassEntry {
            name: name.to_owned(),
            probes: Arc::new( ProbeArray::new( probe_count ) )
        });

        entry.probes.clone()
    }

    pub fn class_count( &self ) -> usize {
        self.classes.lock().len()
    }
}

impl ExecutionDataSource for RuntimeData {
    fn session_id( &self ) -> String {
        self.session.lock().id.clone()
    }

    fn collect( &self, visitor: &mut dyn ExecutionDataVisitor, reset: bool ) -> io::Result< () > {
        let info = {
            let mut session = self.session.lock();
            let info = SessionInfo {
                id: session.id.clone(),
                start: session.start,
                dump: Timestamp::now()
            };

            if reset {
                session.start = info.dump;
            }

            info
        };

        let snapshot: Vec< ExecutionData > = {
            let classes = self.classes.lock();
            classes.iter().map( |(&id, entry)| {
                let data = ExecutionData {
                    id,
                    name: entry.name.clone(),
                    probes: entry.probes.snapshot()
                };

                if reset {
                    entry.probes.reset();
                }

                data
            }).collect()
        };

        visitor.visit_session_info( &info )?;
        for data in &snapshot {
            visitor.visit_class_execution( data )?;
        }

        Ok(())
    }

    fn reset( &self ) {
        self.session.lock().start = Timestamp::now();
        for entry in self.classes.lock().values() {
            entry.probes.reset();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub struct RecordingVisitor {
        pub sessions: Vec< SessionInfo >,
        pub classes: Vec< ExecutionData >
    }

    impl ExecutionDataVisitor for RecordingVisitor {
        fn visit_session_info( &mut self, info: &SessionInfo ) -> io::Result< () > {
            self.sessions.push( info.clone() );
            Ok(())
        }

        fn visit_class_execution( &mut self, data: &ExecutionData ) -> io::Result< () > {
            self.classes.push( data.clone() );
            Ok(())
        }
    }

    #[test]
    fn test_collect_emits_session_and_classes() {
        let data = RuntimeData::new( "stubid" );
        let foo = data.probes( 0x12345678, "Foo", 42 );
        data.probes( 0x1, "Bar", 3 );
        foo.hit( 0 );
        foo.hit( 41 );
        foo.hit( 1000 );

        let mut visitor = RecordingVisitor::default();
        data.collect( &mut visitor, false ).unwrap();

        assert_eq!( visitor.sessions.len(), 1 );
        assert_eq!( visitor.sessions[ 0 ].id, "stubid" );
        assert_eq!( visitor.classes.len(), 2 );
        assert_eq!( visitor.classes[ 0 ].name, "Bar" );
        assert!( !visitor.classes[ 0 ].has_hits() );

        let foo_data = &visitor.classes[ 1 ];
        assert_eq!( foo_data.id, 0x12345678 );
        assert_eq!( foo_data.probes.len(), 42 );
        assert!( foo_data.probes[ 0 ] && foo_data.probes[ 41 ] && !foo_data.probes[ 1 ] );
    }

    #[test]
    fn test_collect_with_reset() {
        let data = RuntimeData::new( "session" );
        let probes = data.probes( 7, "Foo", 4 );
        probes.hit( 2 );

        let mut first = RecordingVisitor::default();
        data.collect( &mut first, true ).unwrap();
        assert!( first.classes[ 0 ].has_hits() );

        let mut second = RecordingVisitor::default();
        data.collect( &mut second, false ).unwrap();
        assert!( !second.classes[ 0 ].has_hits() );
        assert!( second.sessions[ 0 ].start >= first.sessions[ 0 ].start );
        assert_eq!( second.sessions[ 0 ].start, first.sessions[ 0 ].dump );
    }

    #[test]
    fn test_same_class_shares_probes() {
        let data = RuntimeData::new( "session" );
        let a = data.probes( 1, "Foo", 2 );
        let b = data.probes( 1, "Foo", 2 );
        a.hit( 1 );
        assert_eq!( b.snapshot(), vec![ false, true ] );
        assert_eq!( data.class_count(), 1 );

        data.reset();
        assert_eq!( b.snapshot(), vec![ false, false ] );
    }
}
