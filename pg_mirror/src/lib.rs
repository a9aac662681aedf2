pub mod clients;
pub mod conversions;
pub mod pipeline;
pub mod table;
