// Channel descriptors
//
// A channel stands in for one of the guest's I/O endpoints: a file, a
// pipe, or a bound network socket, none of which this loader actually
// opens (full I/O dispatch lives outside this crate's scope). What does
// live here is the descriptor table itself, parsed straight out of the
// manifest's `Channel = uri,alias,type,tag,g#,gb,p#,pb` lines, since the
// loader must validate and account for channels whether or not it can
// serve them.

use log::debug;

use crate::error::LoaderError;
use crate::manifest::ManifestStore;

const LOG_TARGET: &str = "channel";
const CHANNEL_FIELDS: usize = 8;

/// Access pattern and direction a channel was opened with. Encoded 0..3
/// in manifest order: sequential-read, sequential-write, random-read,
/// random-write (spec.md §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    SequentialRead,
    SequentialWrite,
    RandomRead,
    RandomWrite,
}

impl ChannelType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelType::SequentialRead),
            1 => Some(ChannelType::SequentialWrite),
            2 => Some(ChannelType::RandomRead),
            3 => Some(ChannelType::RandomWrite),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ChannelType::SequentialRead => 0,
            ChannelType::SequentialWrite => 1,
            ChannelType::RandomRead => 2,
            ChannelType::RandomWrite => 3,
        }
    }

    /// Bit 0 = readable, bit 1 = writable.
    pub fn io_mask(self) -> u8 {
        match self {
            ChannelType::SequentialRead | ChannelType::RandomRead => 0b01,
            ChannelType::SequentialWrite | ChannelType::RandomWrite => 0b10,
        }
    }

    pub fn is_readable(self) -> bool {
        self.io_mask() & 0b01 != 0
    }

    pub fn is_writable(self) -> bool {
        self.io_mask() & 0b10 != 0
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, ChannelType::SequentialRead | ChannelType::SequentialWrite)
    }
}

/// Per-direction quota, parsed from the manifest's `g#,gb,p#,pb` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelLimits {
    pub gets_count: u64,
    pub gets_bytes: u64,
    pub puts_count: u64,
    pub puts_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub uri: String,
    pub alias: String,
    pub kind: ChannelType,
    pub tag: Option<String>,
    pub limits: ChannelLimits,
}

impl ChannelDescriptor {
    /// Parses one `Channel = ...` manifest value, a comma-separated line
    /// of exactly 8 fields: `uri,alias,type,tag,g#,gb,p#,pb`.
    pub fn parse(value: &str) -> Result<Self, LoaderError> {
        let fields: Vec<&str> = value.split(',').map(|f| f.trim()).collect();
        if fields.len() != CHANNEL_FIELDS {
            return Err(LoaderError::BadManifest {
                path: "<channel line>".into(),
                reason: format!(
                    "channel descriptor needs {CHANNEL_FIELDS} fields, found {}",
                    fields.len()
                ),
            });
        }

        let uri = fields[0].to_string();
        let alias = fields[1].to_string();
        if uri.is_empty() || alias.is_empty() {
            return Err(LoaderError::BadManifest {
                path: "<channel line>".into(),
                reason: "channel uri and alias must be non-empty".into(),
            });
        }

        let code: u8 = fields[2]
            .parse()
            .map_err(|_| bad_field("type", fields[2]))?;
        let kind = ChannelType::from_code(code).ok_or_else(|| bad_field("type", fields[2]))?;

        let tag = if fields[3].is_empty() {
            None
        } else {
            Some(fields[3].to_string())
        };

        let limits = ChannelLimits {
            gets_count: parse_limit(fields[4])?,
            gets_bytes: parse_limit(fields[5])?,
            puts_count: parse_limit(fields[6])?,
            puts_bytes: parse_limit(fields[7])?,
        };

        debug!(target: LOG_TARGET, "parsed channel {alias} ({uri}) as {kind:?}");

        Ok(ChannelDescriptor {
            uri,
            alias,
            kind,
            tag,
            limits,
        })
    }
}

fn parse_limit(field: &str) -> Result<u64, LoaderError> {
    field.parse().map_err(|_| bad_field("limit", field))
}

fn bad_field(what: &str, got: &str) -> LoaderError {
    LoaderError::BadManifest {
        path: "<channel line>".into(),
        reason: format!("invalid channel {what}: {got:?}"),
    }
}

/// Reads every `Channel = ...` record out of `manifest`, in manifest
/// order. An empty result is valid: a session with no configured
/// channels still loads, it just can't talk to anything.
pub fn load_channels(manifest: &ManifestStore) -> Result<Vec<ChannelDescriptor>, LoaderError> {
    manifest
        .get_all("Channel", usize::MAX)
        .into_iter()
        .map(ChannelDescriptor::parse)
        .collect()
}
