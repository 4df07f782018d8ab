pub struct Config {
    pub verbose: bool,
}

impl Config {
    pub fn load() -> Config {
        Config { verbose: false }
    }
}

pub fn process(cfg: &Config) -> i32 {
    if cfg.verbose {
        1
    } else {
        0
    }
}
