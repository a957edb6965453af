pub mod replay;
pub mod selftest;
pub mod watch;
