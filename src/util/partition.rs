use serde::Serialize;

use crate::error::ConfigError;

/// A contiguous slice `[first_record, first_record + length)` of a relation in
/// its natural store order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub number: u64,
    pub first_record: u64,
    pub length: u64,
}

impl Partition {
    pub fn end(&self) -> u64 {
        self.first_record + self.length
    }
}

/// Full cover of `[0, element_count)` by partitions of `partition_size`
/// records plus one shorter residual partition when the count does not divide
/// evenly. Partitions are computed on demand, never materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioning {
    element_count: u64,
    size: u64,
}

impl Partitioning {
    pub fn new(element_count: u64, partition_size: usize) -> Result<Self, ConfigError> {
        if partition_size == 0 {
            return Err(ConfigError::invalid("partition_size", "must be > 0"));
        }
        Ok(Self {
            element_count,
            size: partition_size as u64,
        })
    }

    pub fn count_partitions(&self) -> usize {
        self.element_count.div_ceil(self.size) as usize
    }

    pub fn count_elements(&self) -> u64 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn iter(&self) -> Partitions {
        Partitions {
            cover: *self,
            next: 0,
        }
    }
}

/// Iterator over the partitions of a [`Partitioning`], in order.
#[derive(Debug, Clone)]
pub struct Partitions {
    cover: Partitioning,
    next: u64,
}

impl Iterator for Partitions {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let first_record = self.next.checked_mul(self.cover.size)?;
        if first_record >= self.cover.element_count {
            return None;
        }
        let part = Partition {
            number: self.next,
            first_record,
            length: self.cover.size.min(self.cover.element_count - first_record),
        };
        self.next += 1;
        Some(part)
    }
}

impl IntoIterator for &Partitioning {
    type Item = Partition;
    type IntoIter = Partitions;

    fn into_iter(self) -> Partitions {
        self.iter()
    }
}
