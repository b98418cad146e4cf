pub mod namaste;
