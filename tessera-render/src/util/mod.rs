mod frame_pacer;

pub use self::frame_pacer::*;
