//! Pure parsers turning socket-table dumps into census samples.

pub mod netstat;
pub mod procfs;
