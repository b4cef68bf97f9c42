use std::fs;

use anyhow::{anyhow, Context};
use log::info;
use structopt::StructOpt;

use uf2boot::boot::{BootConfig, Bootloader, Timeouts};
use uf2boot::flash::{MemFlash, RP2040_LAYOUT};
use uf2boot::io::Indicator;
use uf2boot::serial::HostSerialPort;
use uf2boot::xmodem;

mod cli;

/// Indicator that narrates to the log instead of driving a pin.
struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        log::debug!("indicator {}", if on { "on" } else { "off" });
    }

    fn toggle(&mut self) {
        log::trace!("indicator toggle");
    }
}

fn main() -> Result<(), anyhow::Error> {
    pretty_env_logger::init();

    let opts = cli::Opts::from_args();

    let flash = if opts.flash_image.exists() {
        let data = fs::read(&opts.flash_image).with_context(|| {
            format!("Failed to read flash image '{}'", opts.flash_image.display())
        })?;

        if data.len() != RP2040_LAYOUT.flash_size as usize {
            return Err(anyhow!(
                "flash image '{}' is {} bytes, expected {}",
                opts.flash_image.display(),
                data.len(),
                RP2040_LAYOUT.flash_size
            ));
        }

        MemFlash::from_vec(data)
    } else {
        MemFlash::new(RP2040_LAYOUT.flash_size as usize)
    };

    let port = HostSerialPort::open(opts.serial_port.as_str(), opts.baud_rate)
        .with_context(|| format!("Could not open serial port {}", opts.serial_port))?;

    let config = BootConfig {
        timeouts: Timeouts {
            initial_packet_ms: opts.initial_timeout,
            boot_ms: opts.boot_timeout,
            packet_ms: opts.packet_timeout,
            data_ms: opts.data_timeout,
        },
        xmodem: xmodem::Config {
            purge_timeout_ms: opts.purge_timeout,
            retry: opts.retry,
        },
        ..BootConfig::default()
    };

    let mut bootloader = Bootloader::new(port, flash, LogIndicator, config);

    loop {
        let launch = bootloader.attempt()?;

        fs::write(&opts.flash_image, bootloader.flash().data()).with_context(|| {
            format!("Failed to write flash image '{}'", opts.flash_image.display())
        })?;

        if let Some(launch) = launch {
            info!("would jump to vector table at {:#010x}", launch.vector_addr);
            break;
        }

        if opts.once {
            break;
        }
    }

    Ok(())
}
