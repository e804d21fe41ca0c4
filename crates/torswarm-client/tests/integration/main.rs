mod common;
mod control_tests;
mod sink_tests;
