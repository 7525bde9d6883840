pub mod srv;
