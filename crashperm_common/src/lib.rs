pub mod wlog;
