pub mod counts;
pub mod ensemble;
pub mod hkv;
pub mod instance;
pub mod kvarena;
pub mod sheets;
