pub mod energy_archive;

pub use energy_archive::EnergyArchive;
