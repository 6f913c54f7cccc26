//! Double-difference earthquake relocation driven by waveform
//! cross-correlation.
//!
//! Given a seed catalog (events, phase picks, station metadata) and access
//! to waveforms, this crate refines hypocenters by exploiting travel-time
//! differences between spatially close event pairs: absolute differences
//! from the picks, and sub-sample differential times measured by
//! cross-correlating the waveforms of the same phase at the same station.
//! The final inversion of the double differences is delegated to the
//! external `ph2dt` and `hypoDD` binaries, driven over file I/O.
//!
//! The entry point is [`relocator::Relocator`], which supports relocating
//! a whole catalog (multi-event mode) or one new origin against a
//! pre-loaded background catalog (single-event mode).

pub mod catalog;
pub mod clustering;
pub mod config;
pub mod constants;
pub mod ddfiles;
pub mod geom;
pub mod inventory;
pub mod process;
pub mod relocator;
pub mod rtdd_errors;
pub mod utctime;
pub mod waveform;
pub mod xcorr;

pub use catalog::Catalog;
pub use config::Config;
pub use relocator::Relocator;
pub use rtdd_errors::RtddError;
