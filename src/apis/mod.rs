pub mod mongodb_types;
