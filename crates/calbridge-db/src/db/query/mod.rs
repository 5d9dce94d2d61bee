pub mod audit;
pub mod mappings;
pub mod pairs;
