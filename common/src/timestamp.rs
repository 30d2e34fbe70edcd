use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock time in milliseconds since the Unix epoch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Default)]
pub struct Timestamp( u64 );

impl Add for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add( self, rhs: Timestamp ) -> Self::Output {
        Timestamp( self.0 + rhs.0 )
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn sub( self, rhs: Timestamp ) -> Self::Output {
        Timestamp( self.0.saturating_sub( rhs.0 ) )
    }
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now().duration_since( UNIX_EPOCH ).unwrap_or( Duration::from_secs( 0 ) );
        Timestamp( elapsed.as_millis() as u64 )
    }

    #[inline]
    pub const fn from_secs( secs: u64 ) -> Self {
        Timestamp( secs * 1_000 )
    }

    #[inline]
    pub const fn from_msecs( msecs: u64 ) -> Self {
        Timestamp( msecs )
    }

    /// Converts the signed value found on the wire; negative values clamp to the epoch.
    #[inline]
    pub fn from_wire( value: i64 ) -> Self {
        Timestamp( value.max( 0 ) as u64 )
    }

    #[inline]
    pub fn min() -> Self {
        Timestamp( 0 )
    }

    #[inline]
    pub fn as_secs( &self ) -> u64 {
        self.0 / 1_000
    }

    #[inline]
    pub fn as_msecs( &self ) -> u64 {
        self.0
    }

    #[inline]
    pub fn to_wire( &self ) -> i64 {
        self.0.min( i64::MAX as u64 ) as i64
    }

    #[inline]
    pub fn fract_msecs( &self ) -> u64 {
        self.0 % 1_000
    }
}

#[test]
fn test_timestamp() {
    let ts = Timestamp::from_msecs( 333_987 );
    assert_eq!( ts.as_secs(), 333 );
    assert_eq!( ts.as_msecs(), 333_987 );
    assert_eq!( ts.fract_msecs(), 987 );

    assert_eq!(
        ts - Timestamp::from_secs( 133 ),
        Timestamp::from_msecs( 200_987 )
    );

    assert_eq!( Timestamp::from_secs( 1 ) - Timestamp::from_secs( 2 ), Timestamp::min() );
    assert_eq!( Timestamp::from_wire( -5 ), Timestamp::min() );
    assert_eq!( Timestamp::from_wire( ts.to_wire() ), ts );
}
