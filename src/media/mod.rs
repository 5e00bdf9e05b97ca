pub mod frame;
pub mod nal;
pub mod source;
pub mod udp_reader;
