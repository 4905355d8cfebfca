//! Configuration for blobstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::allocation::{LengthPlusFixedPercent, SpaceAllocationStrategy, WriterDecides};
use crate::error::{BlobError, Result};
use crate::record::{LARGE_MAX_CAPACITY, OFFSET_BUCKET};

/// Default page size: 1 MiB
pub const DEFAULT_PAGE_SIZE: usize = 1 << 20;

/// Smallest page able to hold the file header plus a few records
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest page whose records still have a 24-bit capacity field
pub const MAX_PAGE_SIZE: usize = 1 << 24;

/// Main configuration for a blob storage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Backing file. Created on first open.
    pub path: PathBuf,

    /// Page size of the backing file (bytes). Records never cross a page,
    /// so this also bounds the largest payload.
    pub page_size: usize,

    // -------------------------------------------------------------------------
    // Allocation Configuration
    // -------------------------------------------------------------------------
    /// How much capacity new and relocated records get
    pub allocation: AllocationConfig,
}

/// Space allocation policy
#[derive(Debug, Clone, Copy)]
pub enum AllocationConfig {
    /// Capacity = capacity of the buffer the writer produced
    WriterDecides {
        default_capacity: usize,
        max_capacity: usize,
    },

    /// Capacity = length + fixed headroom + percentage of the length
    LengthPlusFixedPercent {
        default_capacity: usize,
        min_capacity: usize,
        max_capacity: usize,
        fixed_headroom: usize,
        percent: usize,
    },
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig::LengthPlusFixedPercent {
            default_capacity: 256,
            min_capacity: 64,
            max_capacity: LARGE_MAX_CAPACITY,
            fixed_headroom: 16,
            percent: 30,
        }
    }
}

impl AllocationConfig {
    /// Instantiate the strategy described by this config
    pub fn build(&self) -> Result<Arc<dyn SpaceAllocationStrategy>> {
        Ok(match *self {
            AllocationConfig::WriterDecides {
                default_capacity,
                max_capacity,
            } => Arc::new(WriterDecides::new(default_capacity, max_capacity)?),
            AllocationConfig::LengthPlusFixedPercent {
                default_capacity,
                min_capacity,
                max_capacity,
                fixed_headroom,
                percent,
            } => Arc::new(LengthPlusFixedPercent::new(
                default_capacity,
                min_capacity,
                max_capacity,
                fixed_headroom,
                percent,
            )?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./blobstore.data"),
            page_size: DEFAULT_PAGE_SIZE,
            allocation: AllocationConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the settings without touching the file system
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        self.allocation.build()?;
        Ok(())
    }
}

/// Page size must be a multiple of the offset bucket in
/// `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || page_size % OFFSET_BUCKET != 0 {
        return Err(BlobError::InvalidArgument(format!(
            "page_size({}) must be a multiple of {} in [{}, {}]",
            page_size, OFFSET_BUCKET, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the space allocation policy
    pub fn allocation(mut self, allocation: AllocationConfig) -> Self {
        self.config.allocation = allocation;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
