pub mod encoder;
pub mod evidence;
pub mod recorder;
