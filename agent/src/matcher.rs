use glob::Pattern;

use crate::error::ConfigError;

/// A list of `:`-separated wildcard expressions; `*` and `?` also match `/`.
#[derive(Clone, Debug)]
pub struct WildcardMatcher {
    patterns: Vec< Pattern >
}

impl WildcardMatcher {
    pub fn new( expression: &str ) -> Result< Self, ConfigError > {
        let patterns = expression
            .split( ':' )
            .filter( |pattern| !pattern.is_empty() )
            .map( |pattern| {
                Pattern::new( pattern ).map_err( |error| ConfigError::InvalidPattern {
                    pattern: pattern.to_owned(),
                    reason: error.msg.to_owned()
                })
            })
            .collect::< Result< Vec< _ >, _ > >()?;

        Ok( WildcardMatcher { patterns } )
    }

    /// An empty expression matches nothing.
    pub fn matches( &self, path: &str ) -> bool {
        self.patterns.iter().any( |pattern| pattern.matches( path ) )
    }
}

#[test]
fn test_wildcard_matcher() {
    let matcher = WildcardMatcher::new( "com/example/*:org/acme/?ar.class" ).unwrap();
    assert!( matcher.matches( "com/example/Foo.class" ) );
    assert!( matcher.matches( "com/example/sub/Foo.class" ) );
    assert!( matcher.matches( "org/acme/Bar.class" ) );
    assert!( !matcher.matches( "org/acme/Baar.class" ) );
    assert!( !matcher.matches( "net/example/Foo.class" ) );

    assert!( !WildcardMatcher::new( "" ).unwrap().matches( "anything" ) );
    assert!( WildcardMatcher::new( "*" ).unwrap().matches( "a/b/c" ) );
    assert!( WildcardMatcher::new( "a/[" ).is_err() );
}
