/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Host Call records.
//!
//! A sandboxed child cannot update the pagemap or the large-block free pool
//! itself; it asks the host with a fixed-size [`HostCallRequest`] and always
//! receives exactly one [`HostCallResponse`]. Records travel over a
//! `SOCK_SEQPACKET` socket so one read yields one record.

use bytemuck::{Pod, Zeroable};

/// The operations a child may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[repr(u64)]
pub enum HostCallKind {
    /// Return a large block to the free pool. `arg0` is the address, `arg1` the large class.
    PushLargeStack = 0,
    /// Take a large block of class `arg1` from the free pool.
    PopLargeStack = 1,
    /// Carve a fresh large block of class `arg1` out of the range.
    Reserve = 2,
    /// Set the single pagemap entry for `arg0` to the byte `arg1`.
    Set = 3,
    /// Mark `1 << arg1` bytes at `arg0` as one large allocation.
    SetRange = 4,
    /// Clear the entries of `1 << arg1` bytes at `arg0`.
    ClearRange = 5,
}

impl HostCallKind {
    /// A short name, used as a metric label.
    pub fn name(self) -> &'static str {
        match self {
            HostCallKind::PushLargeStack => "push_large_stack",
            HostCallKind::PopLargeStack => "pop_large_stack",
            HostCallKind::Reserve => "reserve",
            HostCallKind::Set => "set",
            HostCallKind::SetRange => "set_range",
            HostCallKind::ClearRange => "clear_range",
        }
    }
}

impl TryFrom<u64> for HostCallKind {
    type Error = anyhow::Error;

    fn try_from(value: u64) -> anyhow::Result<Self> {
        Ok(match value {
            0 => HostCallKind::PushLargeStack,
            1 => HostCallKind::PopLargeStack,
            2 => HostCallKind::Reserve,
            3 => HostCallKind::Set,
            4 => HostCallKind::SetRange,
            5 => HostCallKind::ClearRange,
            other => anyhow::bail!("unknown host call kind {}", other),
        })
    }
}

/// A request sent by the child. `kind` is kept raw so that an unknown kind is
/// still a well-formed record that can be answered.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub struct HostCallRequest {
    /// A [`HostCallKind`] discriminant
    pub kind: u64,
    /// First argument, usually an address
    pub arg0: u64,
    /// Second argument, a large class, entry value or size in bits
    pub arg1: u64,
}

const _: () = assert!(core::mem::size_of::<HostCallRequest>() == HostCallRequest::SIZE);

impl HostCallRequest {
    /// Size of the record on the wire.
    pub const SIZE: usize = 24;

    /// Create a request
    pub fn new(kind: HostCallKind, arg0: u64, arg1: u64) -> Self {
        Self {
            kind: kind as u64,
            arg0,
            arg1,
        }
    }

    /// The decoded kind, if it is one this crate knows.
    pub fn kind(&self) -> anyhow::Result<HostCallKind> {
        HostCallKind::try_from(self.kind)
    }

    /// The wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a record. Returns `None` unless `bytes` is exactly [`Self::SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

/// The reply to a [`HostCallRequest`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct HostCallResponse {
    /// Zero on success
    pub error: u64,
    /// Operation result, usually an address
    pub result: u64,
}

const _: () = assert!(core::mem::size_of::<HostCallResponse>() == HostCallResponse::SIZE);

impl HostCallResponse {
    /// Size of the record on the wire.
    pub const SIZE: usize = 16;

    /// A successful response carrying `result`.
    pub fn ok(result: u64) -> Self {
        Self { error: 0, result }
    }

    /// The rejection every request is answered with unless it is accepted.
    pub fn rejected() -> Self {
        Self {
            error: 1,
            result: 0,
        }
    }

    /// Whether the host accepted the request.
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    /// The wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a record. Returns `None` unless `bytes` is exactly [`Self::SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

impl Default for HostCallResponse {
    fn default() -> Self {
        Self::rejected()
    }
}
