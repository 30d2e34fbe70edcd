use {
    std::{
        fs,
        io::{
            self,
            ErrorKind
        },
        net::{
            Shutdown,
            TcpListener,
            TcpStream
        },
        path::{
            Path,
            PathBuf
        },
        sync::Arc,
        thread,
        time::{
            Duration,
            Instant
        }
    },
    common::record::{
        ProjectInfo,
        Record,
        RecordReader
    },
    covstream_agent::{
        BackoffPolicy,
        HeartbeatClock,
        Opt,
        Writer
    }
};

pub const TIMEOUT: Duration = Duration::from_secs( 10 );

pub fn wait_until< F >( timeout: Duration, mut callback: F ) -> bool where F: FnMut() -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if callback() {
            return true;
        }

        thread::sleep( Duration::from_millis( 20 ) );
    }

    callback()
}

pub fn agent_opt( port: u16, class_dump_dir: &Path ) -> Opt {
    Opt {
        port,
        product: "shop".into(),
        project: "cart".into(),
        service: "checkout".into(),
        branch: "main".into(),
        commit: "0a1b2c".into(),
        git_url: "https://git.example.com/shop/cart.git".into(),
        class_dump_dir: class_dump_dir.to_owned(),
        heartbeat_interval: Duration::from_secs( 60 ),
        connect_timeout: Duration::from_secs( 1 ),
        backoff: BackoffPolicy {
            base: Duration::from_millis( 50 ),
            cap: Duration::from_millis( 200 )
        },
        .. Opt::default()
    }
}

pub fn project_info() -> ProjectInfo {
    ProjectInfo {
        product: "shop".into(),
        project: "cart".into(),
        service: "checkout".into(),
        branch: "main".into(),
        commit: "0a1b2c".into(),
        git_url: "https://git.example.com/shop/cart.git".into()
    }
}

pub fn write_file( path: &Path, contents: &[u8] ) {
    fs::create_dir_all( path.parent().unwrap() ).unwrap();
    fs::write( path, contents ).unwrap();
}

pub fn files_with_extension( root: &Path, extension: &str ) -> Vec< PathBuf > {
    let mut output = Vec::new();
    let mut pending = vec![ root.to_owned() ];
    while let Some( directory ) = pending.pop() {
        let entries = match fs::read_dir( &directory ) {
            Ok( entries ) => entries,
            Err( _ ) => continue
        };

        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push( path );
            } else if path.extension().map( |ext| ext == extension ).unwrap_or( false ) {
                output.push( path );
            }
        }
    }

    output.sort();
    output
}

/// Reads as many records as were fully flushed to the given `.exec` file.
pub fn read_exec_file( path: &Path ) -> Vec< Record > {
    let fp = match fs::File::open( path ) {
        Ok( fp ) => fp,
        Err( _ ) => return Vec::new()
    };

    let mut reader = RecordReader::new( fp );
    let mut output = Vec::new();
    while let Ok( Some( record ) ) = reader.read_record() {
        output.push( record );
    }

    output
}

/// A hand-driven collector end of a single agent connection.
pub struct ScriptedPeer {
    pub reader: RecordReader< TcpStream >,
    pub writer: Writer< TcpStream >,
    socket: TcpStream
}

impl ScriptedPeer {
    pub fn next_record( &mut self ) -> Record {
        match self.reader.read_record() {
            Ok( Some( record ) ) => record,
            result => panic!( "expected a record from the agent, got: {:?}", result )
        }
    }

    /// Skips heartbeats.
    pub fn next_non_heartbeat( &mut self ) -> Record {
        loop {
            match self.next_record() {
                Record::Heartbeat => continue,
                record => return record
            }
        }
    }

    pub fn expect_handshake( &mut self ) {
        assert_eq!( self.next_record(), Record::header() );
        assert_eq!( self.next_record(), Record::ProjectInfo( project_info() ) );
    }

    pub fn hang_up( self ) {
        let _ = self.socket.shutdown( Shutdown::Both );
    }
}

pub struct ScriptedCollector {
    listener: TcpListener
}

impl ScriptedCollector {
    pub fn bind() -> Self {
        let listener = TcpListener::bind( "127.0.0.1:0" ).unwrap();
        listener.set_nonblocking( true ).unwrap();
        ScriptedCollector { listener }
    }

    pub fn port( &self ) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub fn accept( &self ) -> io::Result< ScriptedPeer > {
        let start = Instant::now();
        let socket = loop {
            match self.listener.accept() {
                Ok( (socket, _) ) => break socket,
                Err( ref error ) if error.kind() == ErrorKind::WouldBlock && start.elapsed() < TIMEOUT => {
                    thread::sleep( Duration::from_millis( 10 ) );
                },
                Err( error ) => return Err( error )
            }
        };

        socket.set_nonblocking( false )?;
        socket.set_read_timeout( Some( TIMEOUT ) )?;

        let writer = Writer::new( socket.try_clone()?, Arc::new( HeartbeatClock::new() ) )?;
        Ok( ScriptedPeer {
            reader: RecordReader::new( socket.try_clone()? ),
            writer,
            socket
        })
    }
}
