// Copyright 2024 The avrsim Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command-line front end: load a raw firmware image into a simulated
//! MCU and run it to completion.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use argh::FromArgs;

use avr_core::CpuState;

#[derive(FromArgs)]
/// Simulate an 8-bit AVR microcontroller.
struct Args {
    /// raw firmware image, loaded at flash address zero
    #[argh(positional)]
    firmware: PathBuf,

    /// which MCU to simulate (see --list-mcus)
    #[argh(option, default = "String::from(\"atmega88\")")]
    mcu: String,

    /// CPU frequency in whole MHz
    #[argh(option, default = "8")]
    frequency: u32,

    /// stop after this many cycles (0 = run until done)
    #[argh(option, default = "0")]
    limit: u64,

    /// data-space address of a byte console for firmware output
    #[argh(option)]
    console: Option<u16>,

    /// slow the simulation down to roughly wall-clock speed
    #[argh(switch)]
    throttle: bool,

    /// list the supported MCUs and exit
    #[argh(switch)]
    list_mcus: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Args = argh::from_env();

    if args.list_mcus {
        for name in chips::known_mcus() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut avr = chips::make_mcu_by_name(&args.mcu, args.frequency)?;
    let image = std::fs::read(&args.firmware)
        .with_context(|| format!("reading {}", args.firmware.display()))?;
    avr.load_code(&image, 0)?;
    if let Some(addr) = args.console {
        avr.set_console_register(addr);
    }
    log::info!(
        "{}: {} bytes of firmware at {} MHz",
        avr.mmcu,
        image.len(),
        args.frequency
    );

    let started = Instant::now();
    let state = loop {
        let state = avr.step();
        match state {
            CpuState::Running | CpuState::Sleeping | CpuState::StepDone => {}
            _ => break state,
        }
        if args.limit != 0 && avr.cycle >= args.limit {
            break state;
        }
        if args.throttle && avr.cycle % 4096 == 0 {
            // Sleep off any lead the simulation has built up over the
            // host clock.
            let simulated = Duration::from_micros(avr.cycles_to_usec(avr.cycle));
            let elapsed = started.elapsed();
            if simulated > elapsed {
                std::thread::sleep(simulated - elapsed);
            }
        }
    };

    let out = avr.console_take();
    if !out.is_empty() {
        print!("{}", String::from_utf8_lossy(&out));
    }
    log::info!("stopped after {} cycles in state {:?}", avr.cycle, state);

    match state {
        CpuState::Done | CpuState::Running | CpuState::Sleeping | CpuState::Stopped => Ok(()),
        state => bail!("simulation ended in state {:?}", state),
    }
}
