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

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result, bail};
use heapbox_common::host_call::{HostCallKind, HostCallRequest, HostCallResponse};

/// Sends Host Call requests to the pagemap service and waits for the reply.
///
/// The channel is a `SOCK_SEQPACKET` socket, so each write is one request and
/// each read one response. There is at most one outstanding request.
pub struct HostServiceClient {
    channel: UnixStream,
}

impl HostServiceClient {
    /// Wraps the child end of the Host Call channel.
    pub fn new(channel: OwnedFd) -> Self {
        Self {
            channel: UnixStream::from(channel),
        }
    }

    /// Sends one request and returns the host's response.
    pub fn request(&mut self, kind: HostCallKind, arg0: u64, arg1: u64) -> Result<HostCallResponse> {
        let request = HostCallRequest::new(kind, arg0, arg1);
        let written = self
            .channel
            .write(request.as_bytes())
            .context("sending host call")?;
        if written != HostCallRequest::SIZE {
            bail!("short write of host call ({} bytes)", written);
        }

        let mut buf = [0u8; HostCallResponse::SIZE + 1];
        let read = self.channel.read(&mut buf).context("reading host call response")?;
        if read == 0 {
            bail!("host closed the pagemap channel");
        }
        HostCallResponse::from_bytes(&buf[..read])
            .with_context(|| format!("malformed host call response of {} bytes", read))
    }
}

#[cfg(test)]
mod tests {
    use heapbox_testing::seqpacket_pair;

    use super::*;

    #[test]
    fn request_and_response_travel_as_records() {
        let (ours, theirs) = seqpacket_pair().unwrap();
        let server = std::thread::spawn(move || {
            let mut host = UnixStream::from(theirs);
            let mut buf = [0u8; 64];
            let n = host.read(&mut buf).unwrap();
            let req = HostCallRequest::from_bytes(&buf[..n]).unwrap();
            assert_eq!(req.kind().unwrap(), HostCallKind::Reserve);
            host.write_all(HostCallResponse::ok(0x4000_0000).as_bytes())
                .unwrap();
        });
        let mut client = HostServiceClient::new(ours);
        let resp = client.request(HostCallKind::Reserve, 0, 3).unwrap();
        assert_eq!(resp, HostCallResponse::ok(0x4000_0000));
        server.join().unwrap();
    }

    #[test]
    fn closed_channel_is_an_error() {
        let (ours, theirs) = seqpacket_pair().unwrap();
        let server = std::thread::spawn(move || {
            let mut host = UnixStream::from(theirs);
            let mut buf = [0u8; 64];
            let _ = host.read(&mut buf).unwrap();
            // drop without answering
        });
        let mut client = HostServiceClient::new(ours);
        assert!(client.request(HostCallKind::PopLargeStack, 0, 0).is_err());
        server.join().unwrap();
    }
}
