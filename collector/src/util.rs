use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct Sigint {
    flag: Arc< AtomicBool >
}

impl Sigint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_sent( &self ) -> bool {
        self.flag.load( Ordering::Relaxed )
    }

    pub fn send( &self ) {
        self.flag.store( true, Ordering::Relaxed );
    }
}

pub fn on_ctrlc() -> Result< Sigint, ctrlc::Error > {
    let sigint = Sigint::new();
    {
        let sigint = sigint.clone();
        ctrlc::set_handler( move || {
            sigint.send();
        })?;
    }

    Ok( sigint )
}

pub struct ReadableDuration( pub u64 );

impl fmt::Display for ReadableDuration {
    fn fmt( &self, formatter: &mut fmt::Formatter ) -> fmt::Result {
        let mut secs = self.0;
        macro_rules! get {
            ($mul:expr) => {{
                let mul = $mul;
                let out = secs / mul;
                secs -= out * mul;
                out
            }}
        }

        let hours = get!( 60 * 60 );
        let minutes = get!( 60 );

        if hours > 0 {
            write!( formatter, "{:02}h", hours )?;
        }

        if hours > 0 || minutes > 0 {
            write!( formatter, "{:02}m", minutes )?;
        }

        write!( formatter, "{:02}s", secs )
    }
}

/// Turns an arbitrary string into something safe to use as a single path component.
pub fn sanitize_component( value: &str ) -> String {
    let sanitized: String = value.chars().map( |ch| {
        if ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            ch
        } else {
            '_'
        }
    }).collect();

    match sanitized.as_str() {
        "" => "default".to_owned(),
        "." | ".." => sanitized.replace( '.', "_" ),
        _ => sanitized
    }
}

#[test]
fn test_readable_duration() {
    assert_eq!( ReadableDuration( 5 ).to_string(), "05s" );
    assert_eq!( ReadableDuration( 65 ).to_string(), "01m05s" );
    assert_eq!( ReadableDuration( 3600 + 2 ).to_string(), "01h00m02s" );
}

#[test]
fn test_sanitize_component() {
    assert_eq!( sanitize_component( "shop" ), "shop" );
    assert_eq!( sanitize_component( "a/b c" ), "a_b_c" );
    assert_eq!( sanitize_component( "" ), "default" );
    assert_eq!( sanitize_component( ".." ), "__" );
    assert_eq!( sanitize_component( "v1.2" ), "v1.2" );
}
