// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-MCU configuration tables.
//!
//! Everything here is data: register addresses, bit positions, vector
//! numbers and mode tables handed to the `avr_core` builder. No chip has
//! behavior code of its own.

use remain::sorted;
use thiserror::Error;

use avr_core::{Avr, Chip, ConfigError};

mod atmega88;
mod attiny85;

pub use atmega88::atmega88;
pub use attiny85::attiny85;

#[sorted]
#[derive(Error, Debug)]
pub enum ChipError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("MCU '{0}' is not known")]
    Unknown(String),
}

/// All chip names `make_mcu_by_name` accepts.
pub fn known_mcus() -> &'static [&'static str] {
    &["attiny85", "atmega88"]
}

/// Build a machine for a named MCU.
pub fn make_mcu_by_name(name: &str, frequency_mhz: u32) -> Result<Avr, ChipError> {
    let chip: Chip = match name {
        "attiny85" => attiny85(),
        "atmega88" => atmega88(),
        _ => return Err(ChipError::Unknown(name.to_string())),
    };
    Ok(Avr::new(chip, frequency_mhz)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_known_mcus_build() {
        for name in known_mcus() {
            let avr = make_mcu_by_name(name, 8).unwrap();
            assert_eq!(avr.state, avr_core::CpuState::Running);
        }
    }

    #[test]
    fn unknown_mcu_is_an_error() {
        assert!(matches!(
            make_mcu_by_name("atmega4809", 8),
            Err(ChipError::Unknown(_))
        ));
    }
}
