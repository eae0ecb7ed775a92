//! Bidirectional host<->presented uid/gid translation (spec §3, §4.10).

use crate::error::{FsError, FsResult};

#[derive(Clone, Copy, Debug)]
pub struct IdRange {
    pub host_base: u32,
    pub presented_base: u32,
    pub length: u32,
}

impl IdRange {
    /// Parse one `h:p:l` triple out of a `uidmapping=`/`gidmapping=` value.
    pub fn parse(s: &str) -> FsResult<Self> {
        let mut it = s.split(':');
        let host_base = it.next().ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?;
        let presented_base = it.next().ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?;
        let length = it.next().ok_or(FsError::InvalidInput)?.parse().map_err(|_| FsError::InvalidInput)?;
        if it.next().is_some() {
            return Err(FsError::InvalidInput);
        }
        Ok(Self { host_base, presented_base, length })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum Squash {
    #[default]
    None,
    Root,
    Fixed(u32),
}

#[derive(Clone, Debug, Default)]
pub struct IdMap {
    ranges: Vec<IdRange>,
    squash: Squash,
    overflow: u32,
}

impl IdMap {
    pub fn new(ranges: Vec<IdRange>, squash: Squash, overflow: u32) -> Self {
        Self { ranges, squash, overflow }
    }

    /// Parse the whole colon-joined `uidmapping=`/`gidmapping=` option value,
    /// e.g. `h:p:l[:h:p:l...]`.
    pub fn parse_ranges(spec: &str) -> FsResult<Vec<IdRange>> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() % 3 != 0 {
            return Err(FsError::InvalidInput);
        }
        parts
            .chunks(3)
            .map(|c| IdRange::parse(&c.join(":")))
            .collect()
    }

    /// Read the kernel's overflow id for the given sysctl file, falling back
    /// to the traditional 65534 when it cannot be read (e.g. no /proc).
    pub fn read_overflow(path: &str) -> u32 {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(65534)
    }

    /// host -> presented, used when reporting stat() results to the caller.
    pub fn map_out(&self, host_id: u32) -> u32 {
        match self.squash {
            Squash::Root => return 0,
            Squash::Fixed(id) => return id,
            Squash::None => {}
        }
        for r in &self.ranges {
            if host_id >= r.host_base && host_id < r.host_base + r.length {
                return r.presented_base + (host_id - r.host_base);
            }
        }
        if self.ranges.is_empty() {
            host_id
        } else {
            self.overflow
        }
    }

    /// presented -> host, used when writing ownership to the upper layer.
    pub fn map_in(&self, presented_id: u32) -> u32 {
        for r in &self.ranges {
            if presented_id >= r.presented_base && presented_id < r.presented_base + r.length {
                return r.host_base + (presented_id - r.presented_base);
            }
        }
        if self.ranges.is_empty() {
            presented_id
        } else {
            self.overflow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_no_ranges() {
        let m = IdMap::new(vec![], Squash::None, 65534);
        assert_eq!(m.map_out(1000), 1000);
        assert_eq!(m.map_in(1000), 1000);
    }

    #[test]
    fn range_translation_round_trips() {
        let ranges = IdMap::parse_ranges("0:100000:65536").unwrap();
        let m = IdMap::new(ranges, Squash::None, 65534);
        assert_eq!(m.map_out(0), 100000);
        assert_eq!(m.map_in(100000), 0);
        assert_eq!(m.map_out(65536), 65534); // out of range -> overflow
    }

    #[test]
    fn squash_overrides_short_circuit() {
        let m = IdMap::new(vec![], Squash::Root, 65534);
        assert_eq!(m.map_out(0), 0);
        assert_eq!(m.map_out(12345), 0);

        let m = IdMap::new(vec![], Squash::Fixed(1000), 65534);
        assert_eq!(m.map_out(0), 1000);
    }
}
