#[cfg(test)]
use simplelog::{self, LevelFilter, TestLogger};

#[cfg(test)]
pub fn init_test_log() {
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("mio")
        .set_time_level(LevelFilter::Off)
        .build();
    let _ = TestLogger::init(LevelFilter::Trace, conf);
}
