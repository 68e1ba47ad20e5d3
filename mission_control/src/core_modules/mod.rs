pub mod control;
pub mod detection;
pub mod mission;
pub mod navigation;
pub mod perception;
pub mod timer;
pub mod tracker;
