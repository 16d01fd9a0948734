pub mod interruptible_timer;
pub mod wait_object;
