pub mod reliability;
