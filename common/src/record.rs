use std::io::{self, Read, Write};

use crate::codec::{DataInput, DataOutput};
use crate::request::{PullKind, PullRequest, KnownIds, BLOCK_CMD_DUMP, BLOCK_CMD_OK};
use crate::timestamp::Timestamp;

pub const BLOCK_HEADER: u8 = 0x01;
pub const BLOCK_SESSION_INFO: u8 = 0x10;
pub const BLOCK_EXECUTION_DATA: u8 = 0x11;
pub const BLOCK_HEARTBEAT: u8 = 0x13;
pub const BLOCK_FILE: u8 = 0x14;
pub const BLOCK_PROJECT_INFO: u8 = 0x15;

pub const MAGIC_NUMBER: u16 = 0xC0C0;
pub const FORMAT_VERSION: u16 = 0x1007;

const PROJECT_INFO_SEPARATOR: char = '|';

fn invalid_data<T: Into<Box<dyn std::error::Error + Send + Sync>>>(error: T) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub start: Timestamp,
    pub dump: Timestamp,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExecutionData {
    pub id: i64,
    pub name: String,
    pub probes: Vec<bool>,
}

impl ExecutionData {
    pub fn has_hits(&self) -> bool {
        self.probes.iter().any(|&probe| probe)
    }
}

/// Describes the monitored service; the collector files everything it receives under it.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ProjectInfo {
    pub product: String,
    pub project: String,
    pub service: String,
    pub branch: String,
    pub commit: String,
    pub git_url: String,
}

impl ProjectInfo {
    fn fields(&self) -> [&str; 6] {
        [
            &self.product,
            &self.project,
            &self.service,
            &self.branch,
            &self.commit,
            &self.git_url,
        ]
    }

    fn to_wire(&self) -> io::Result<String> {
        let fields = self.fields();
        if let Some(field) = fields.iter().find(|field| field.contains(PROJECT_INFO_SEPARATOR)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("project info field {:?} contains a '|'", field),
            ));
        }

        Ok(fields.join("|"))
    }

    fn from_wire(string: &str) -> io::Result<Self> {
        let mut fields: Vec<String> = string
            .split(PROJECT_INFO_SEPARATOR)
            .map(|field| field.to_owned())
            .collect();
        if fields.len() > 6 {
            return Err(invalid_data(format!(
                "project info has {} fields",
                fields.len()
            )));
        }

        fields.resize(6, String::new());
        let mut fields = fields.into_iter();
        let mut next = || fields.next().unwrap_or_default();
        Ok(ProjectInfo {
            product: next(),
            project: next(),
            service: next(),
            branch: next(),
            commit: next(),
            git_url: next(),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileChunk {
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Record {
    Header { version: u16 },
    SessionInfo(SessionInfo),
    ExecutionData(ExecutionData),
    Heartbeat,
    File(FileChunk),
    ProjectInfo(ProjectInfo),
    Pull(PullRequest),
    CmdOk,
    CmdDump { dump: bool, reset: bool },
}

impl Record {
    pub fn header() -> Self {
        Record::Header {
            version: FORMAT_VERSION,
        }
    }

    pub fn tag(&self) -> u8 {
        match *self {
            Record::Header { .. } => BLOCK_HEADER,
            Record::SessionInfo(..) => BLOCK_SESSION_INFO,
            Record::ExecutionData(..) => BLOCK_EXECUTION_DATA,
            Record::Heartbeat => BLOCK_HEARTBEAT,
            Record::File(..) => BLOCK_FILE,
            Record::ProjectInfo(..) => BLOCK_PROJECT_INFO,
            Record::Pull(ref request) => request.kind.tag(),
            Record::CmdOk => BLOCK_CMD_OK,
            Record::CmdDump { .. } => BLOCK_CMD_DUMP,
        }
    }

    /// Writes the tag followed by the payload.
    pub fn write_to<W: Write>(&self, out: &mut DataOutput<W>) -> io::Result<()> {
        out.write_u8(self.tag())?;
        match *self {
            Record::Header { version } => {
                out.write_u16(MAGIC_NUMBER)?;
                out.write_u16(version)?;
            }
            Record::SessionInfo(ref info) => {
                out.write_utf(&info.id)?;
                out.write_i64(info.start.to_wire())?;
                out.write_i64(info.dump.to_wire())?;
            }
            Record::ExecutionData(ref data) => {
                out.write_i64(data.id)?;
                out.write_utf(&data.name)?;
                out.write_bool_array(&data.probes)?;
            }
            Record::Heartbeat | Record::CmdOk => {}
            Record::File(ref file) => {
                out.write_utf(&file.name)?;
                out.write_blob(&file.contents)?;
            }
            Record::ProjectInfo(ref info) => {
                out.write_utf(&info.to_wire()?)?;
            }
            Record::Pull(ref request) => {
                out.write_blob(request.known.to_string().as_bytes())?;
            }
            Record::CmdDump { dump, reset } => {
                out.write_bool(dump)?;
                out.write_bool(reset)?;
            }
        }

        Ok(())
    }

    /// Encodes the whole record into a fresh buffer.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = DataOutput::new(Vec::new());
        self.write_to(&mut out)?;
        Ok(out.into_inner())
    }

    /// Decodes the payload of a record whose tag was already consumed.
    pub fn read_body<R: Read>(tag: u8, input: &mut DataInput<R>) -> io::Result<Self> {
        let record = match tag {
            BLOCK_HEADER => {
                let magic = input.read_u16()?;
                if magic != MAGIC_NUMBER {
                    return Err(invalid_data(format!("invalid magic number 0x{:04X}", magic)));
                }

                let version = input.read_u16()?;
                if version != FORMAT_VERSION {
                    return Err(invalid_data(format!(
                        "incompatible format version 0x{:04X}; expected 0x{:04X}",
                        version, FORMAT_VERSION
                    )));
                }

                Record::Header { version }
            }
            BLOCK_SESSION_INFO => Record::SessionInfo(SessionInfo {
                id: input.read_utf()?,
                start: Timestamp::from_wire(input.read_i64()?),
                dump: Timestamp::from_wire(input.read_i64()?),
            }),
            BLOCK_EXECUTION_DATA => Record::ExecutionData(ExecutionData {
                id: input.read_i64()?,
                name: input.read_utf()?,
                probes: input.read_bool_array()?,
            }),
            BLOCK_HEARTBEAT => Record::Heartbeat,
            BLOCK_FILE => Record::File(FileChunk {
                name: input.read_utf()?,
                contents: input.read_blob()?,
            }),
            BLOCK_PROJECT_INFO => Record::ProjectInfo(ProjectInfo::from_wire(&input.read_utf()?)?),
            BLOCK_CMD_OK => Record::CmdOk,
            BLOCK_CMD_DUMP => Record::CmdDump {
                dump: input.read_bool()?,
                reset: input.read_bool()?,
            },
            tag => match PullKind::from_tag(tag) {
                Some(kind) => Record::Pull(PullRequest {
                    kind,
                    known: read_known_ids(input)?,
                }),
                None => return Err(invalid_data(format!("unknown block type 0x{:02X}", tag))),
            },
        };

        Ok(record)
    }
}

/// The identifier list may exceed what a 16-bit length prefix allows, hence the var-int blob.
pub fn read_known_ids<R: Read>(input: &mut DataInput<R>) -> io::Result<KnownIds> {
    let bytes = input.read_blob()?;
    let list = String::from_utf8(bytes).map_err(invalid_data)?;
    Ok(KnownIds::parse(&list))
}

/// The prologue every stream and every exec file starts with.
pub fn file_header() -> Vec<u8> {
    let mut out = vec![BLOCK_HEADER];
    out.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out
}

/// Reads records off a stream, making sure it opens with exactly one header.
pub struct RecordReader<R: Read> {
    input: DataInput<R>,
    seen_header: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(fp: R) -> Self {
        RecordReader {
            input: DataInput::new(fp),
            seen_header: false,
        }
    }

    pub fn input(&mut self) -> &mut DataInput<R> {
        &mut self.input
    }

    pub fn into_inner(self) -> R {
        self.input.into_inner()
    }

    pub fn next_tag(&mut self) -> io::Result<Option<u8>> {
        let tag = match self.input.read_tag()? {
            Some(tag) => tag,
            None => return Ok(None),
        };

        if !self.seen_header && tag != BLOCK_HEADER {
            return Err(invalid_data(format!(
                "stream starts with block 0x{:02X} instead of a header",
                tag
            )));
        }

        Ok(Some(tag))
    }

    pub fn read_body(&mut self, tag: u8) -> io::Result<Record> {
        if tag == BLOCK_HEADER {
            if self.seen_header {
                return Err(invalid_data("duplicate header"));
            }
            self.seen_header = true;
        }

        Record::read_body(tag, &mut self.input)
    }

    pub fn read_record(&mut self) -> io::Result<Option<Record>> {
        match self.next_tag()? {
            Some(tag) => self.read_body(tag).map(Some),
            None => Ok(None),
        }
    }
}
