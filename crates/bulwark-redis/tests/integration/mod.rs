mod common;
mod window_store_tests;
