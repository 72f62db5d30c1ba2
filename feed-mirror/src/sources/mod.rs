pub mod twitter;

pub use twitter::HttpSourceFeed;
