pub mod static_file;

pub use static_file::serve_static;
