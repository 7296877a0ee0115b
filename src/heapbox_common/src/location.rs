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

//! The shared region location handed to the child through its environment.
//!
//! The value is `<hex base>:<hex size>`, lowercase and without a `0x` prefix.

use anyhow::{Context, Result, bail};

/// Name of the environment variable carrying the region location.
pub const SANDBOX_LOCATION: &str = "SANDBOX_LOCATION";

/// Where the shared memory region lives and how large it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLocation {
    /// Base address, identical in host and child
    pub base: usize,
    /// Size in bytes, a power of two
    pub size: usize,
}

impl RegionLocation {
    /// The environment value for this location.
    pub fn encode(&self) -> String {
        format!("{:x}:{:x}", self.base, self.size)
    }

    /// Parses an environment value produced by [`RegionLocation::encode`].
    pub fn parse(value: &str) -> Result<Self> {
        let Some((base, size)) = value.split_once(':') else {
            bail!("{} value {:?} has no ':' separator", SANDBOX_LOCATION, value);
        };
        let base = usize::from_str_radix(base, 16)
            .with_context(|| format!("bad base address in {:?}", value))?;
        let size = usize::from_str_radix(size, 16)
            .with_context(|| format!("bad size in {:?}", value))?;
        if size == 0 || !size.is_power_of_two() {
            bail!("region size {:#x} is not a power of two", size);
        }
        if base % size != 0 {
            bail!("region base {:#x} is not aligned to its size {:#x}", base, size);
        }
        Ok(Self { base, size })
    }

    /// Reads and parses [`SANDBOX_LOCATION`] from the process environment.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(SANDBOX_LOCATION)
            .with_context(|| format!("{} is not set", SANDBOX_LOCATION))?;
        Self::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_as_lowercase_hex() {
        let loc = RegionLocation {
            base: 0x7f00_0000_0000,
            size: 0x400_0000,
        };
        assert_eq!(loc.encode(), "7f0000000000:4000000");
        assert_eq!(RegionLocation::parse(&loc.encode()).unwrap(), loc);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(RegionLocation::parse("7f0000000000").is_err());
        assert!(RegionLocation::parse("zz:1000").is_err());
        assert!(RegionLocation::parse("1000:0").is_err());
        assert!(RegionLocation::parse("1000:3000").is_err());
        // misaligned base
        assert!(RegionLocation::parse("1800:1000").is_err());
    }
}
