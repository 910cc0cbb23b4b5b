//! C10 — resolving sectors across a chain of differencing VHDX overlays
//! stacked on a common, non-differencing base: walk top to base, the first
//! layer that has a sector allocated serves it.

use std::path::Path;

use crate::container::{Container, OpenOptions};
use crate::error::{Result, VhdxError};

/// What [`ChainReader`] needs from a layer. Lets the chain-resolution logic
/// be exercised against lightweight fakes in tests instead of a real VHDX
/// file on disk; [`Container`] is the only production implementation.
pub trait SectorSource {
    fn sector_count(&self) -> u64;
    fn is_differencing(&self) -> bool;
    fn is_sector_allocated(&self, sector_number: u64) -> Result<bool>;
    fn get_sector(&self, sector_number: u64) -> Result<Vec<u8>>;
}

impl SectorSource for Container {
    fn sector_count(&self) -> u64 {
        Container::sector_count(self)
    }

    fn is_differencing(&self) -> bool {
        Container::is_differencing(self)
    }

    fn is_sector_allocated(&self, sector_number: u64) -> Result<bool> {
        Container::is_sector_allocated(self, sector_number)
    }

    fn get_sector(&self, sector_number: u64) -> Result<Vec<u8>> {
        Container::get_sector(self, sector_number)
    }
}

/// An ordered stack of VHDX layers: `layers()[0]` is the non-differencing
/// base; every later layer overlays the one before it.
pub struct ChainReader<S: SectorSource = Container> {
    layers: Vec<S>,
}

impl ChainReader<Container> {
    /// Opens every path in order (base first), applying `options` fresh to
    /// each, then checks that the base isn't itself differencing.
    pub fn open(paths: &[impl AsRef<Path>], options: impl Fn() -> OpenOptions) -> Result<Self> {
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            layers.push(options().open(path)?);
        }
        Self::from_layers(layers)
    }
}

impl<S: SectorSource> ChainReader<S> {
    pub fn from_layers(layers: Vec<S>) -> Result<Self> {
        if let Some(base) = layers.first() {
            if base.is_differencing() {
                return Err(VhdxError::DifferencingBase);
            }
        }
        Ok(ChainReader { layers })
    }

    pub fn layers(&self) -> &[S] {
        &self.layers
    }

    /// The base image's sector count — the chain's logical size.
    pub fn sector_count(&self) -> u64 {
        self.layers.first().map(SectorSource::sector_count).unwrap_or(0)
    }

    /// Reads one sector, consulting layers top to base and returning the
    /// first one that has it allocated. The base is always fully
    /// allocated, so this only fails for an out-of-range sector (surfaced
    /// by the layer's own range check) or an empty chain.
    pub fn get_sector(&self, sector_number: u64) -> Result<Vec<u8>> {
        for layer in self.layers.iter().rev() {
            if layer.is_sector_allocated(sector_number)? {
                return layer.get_sector(sector_number);
            }
        }
        Err(VhdxError::UnresolvedSector(sector_number))
    }
}
