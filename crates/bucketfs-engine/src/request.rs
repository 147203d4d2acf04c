//! Decoded operation records and the replies the engine produces.
//!
//! A transport (virtio-fs, FUSE, the CLI) turns its wire messages into
//! [`Operation`] values and gets back a [`Reply`]. Nothing here knows about
//! wire formats.

use std::time::{Duration, SystemTime};

use bucketfs_core::{DirectoryEntry, EntryKind, ErrorKind, FsResult};
use bytes::Bytes;
use serde::Serialize;

use crate::handle_table::{HandleId, OpenMode};

/// One file-system request.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Session start. Starts background flushing.
    Init,
    /// Session end. Stops background flushing and flushes everything.
    Destroy,
    Lookup {
        parent: HandleId,
        name: String,
    },
    /// Drops `nlookup` references gathered by lookup/create.
    Forget {
        handle: HandleId,
        nlookup: u64,
    },
    GetAttr {
        handle: HandleId,
    },
    /// Only size changes (truncate/extend) are supported.
    SetAttr {
        handle: HandleId,
        size: Option<u64>,
    },
    Mkdir {
        parent: HandleId,
        name: String,
    },
    Rmdir {
        parent: HandleId,
        name: String,
    },
    Create {
        parent: HandleId,
        name: String,
        mode: OpenMode,
        exclusive: bool,
    },
    Unlink {
        parent: HandleId,
        name: String,
    },
    Rename {
        parent: HandleId,
        name: String,
        new_parent: HandleId,
        new_name: String,
    },
    /// Records `mode` on the handle, replacing the flags of earlier opens of
    /// the same path. An `append` mode therefore makes every writer of the
    /// handle append, and a later plain open turns appending off again.
    Open {
        handle: HandleId,
        mode: OpenMode,
    },
    OpenDir {
        handle: HandleId,
    },
    Read {
        handle: HandleId,
        offset: u64,
        length: u32,
    },
    /// With an append open mode the offset is ignored.
    Write {
        handle: HandleId,
        offset: u64,
        data: Bytes,
    },
    ReadDir {
        handle: HandleId,
        offset: u64,
    },
    Release {
        handle: HandleId,
    },
    ReleaseDir {
        handle: HandleId,
    },
    Flush {
        handle: HandleId,
    },
    Fsync {
        handle: HandleId,
        datasync: bool,
    },
    FsyncDir {
        handle: HandleId,
    },
    /// Existence check. Permission bits are not modelled, so `mask` is ignored.
    Access {
        handle: HandleId,
        mask: u32,
    },
    /// Any opcode the engine does not implement.
    Other {
        opcode: u32,
    },
}

impl Operation {
    /// Short lowercase name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Init => "init",
            Operation::Destroy => "destroy",
            Operation::Lookup { .. } => "lookup",
            Operation::Forget { .. } => "forget",
            Operation::GetAttr { .. } => "getattr",
            Operation::SetAttr { .. } => "setattr",
            Operation::Mkdir { .. } => "mkdir",
            Operation::Rmdir { .. } => "rmdir",
            Operation::Create { .. } => "create",
            Operation::Unlink { .. } => "unlink",
            Operation::Rename { .. } => "rename",
            Operation::Open { .. } => "open",
            Operation::OpenDir { .. } => "opendir",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::ReadDir { .. } => "readdir",
            Operation::Release { .. } => "release",
            Operation::ReleaseDir { .. } => "releasedir",
            Operation::Flush { .. } => "flush",
            Operation::Fsync { .. } => "fsync",
            Operation::FsyncDir { .. } => "fsyncdir",
            Operation::Access { .. } => "access",
            Operation::Other { .. } => "other",
        }
    }
}

/// Attributes of a file or directory, built from a live backend stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attributes {
    pub handle: HandleId,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    /// How long the transport may cache these attributes.
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Duration,
}

/// Reply to lookup, mkdir and create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReply {
    pub handle: HandleId,
    pub attributes: Attributes,
    /// How long the transport may cache the name-to-handle mapping.
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,
}

/// One readdir result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryReply {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Offset to pass to the next readdir to continue after this entry.
    pub offset: u64,
}

impl DirEntryReply {
    pub(crate) fn from_entry(entry: &DirectoryEntry, offset: u64) -> Self {
        Self {
            name: entry.name.clone(),
            kind: entry.kind,
            size: entry.size,
            offset,
        }
    }
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Empty,
    /// Lookup or mkdir: the handle carries one lookup reference.
    Entry(EntryReply),
    /// Create: the handle carries a lookup and an open reference.
    Created(EntryReply),
    Attr(Attributes),
    Opened { handle: HandleId },
    #[serde(skip)]
    Data(Bytes),
    Written { size: u32 },
    Entries { entries: Vec<DirEntryReply> },
}

impl Response {
    /// Handle references this reply hands to the requester.
    ///
    /// If the requester is gone, the dispatcher releases them.
    pub fn retained_handle(&self) -> Option<(HandleId, u64)> {
        match self {
            Response::Entry(entry) => Some((entry.handle, 1)),
            Response::Created(entry) => Some((entry.handle, 2)),
            Response::Opened { handle } => Some((*handle, 1)),
            _ => None,
        }
    }
}

/// What every operation returns.
pub type Reply = FsResult<Response>;

/// Status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error(ErrorKind),
}

impl Status {
    pub fn of(reply: &Reply) -> Self {
        match reply {
            Ok(_) => Status::Ok,
            Err(e) => Status::Error(e.kind()),
        }
    }

    /// Negated errno, as FUSE-style transports expect; 0 on success.
    pub fn to_raw(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Error(kind) => -kind.to_errno(),
        }
    }
}
