// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Logging setup for the `gateway` binary. `RUST_LOG` always wins; the
//! `--verbose` flag only raises the default when `RUST_LOG` is unset, so a
//! deployment's own filter configuration is never overridden.

use env_logger::Builder;
use log::LevelFilter;

/// Initializes the global logger. `verbose` raises the default level from
/// `info` to `debug`; an explicit `RUST_LOG` always takes precedence.
pub fn init(verbose: bool) {
    let default_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let mut builder = Builder::new();
    builder.filter_level(default_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic_when_called_twice() {
        init(false);
        init(true);
    }
}
