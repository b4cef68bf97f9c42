use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub struct Opts {
    /// The serial device to listen on
    #[structopt(
        env = "SERIAL_PORT",
        short = "p",
        long = "port",
        default_value = "/dev/ttyUSB0"
    )]
    pub serial_port: String,

    /// The serial baud rate
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "115200"
    )]
    pub baud_rate: u32,

    /// Backing file for the flash image; created fully erased if missing
    #[structopt(long = "flash-image", default_value = "flash.bin")]
    pub flash_image: PathBuf,

    /// Exit after one boot attempt instead of looping
    #[structopt(long = "once")]
    pub once: bool,

    /// Grace window before an installed program is launched, in ms
    #[structopt(long = "boot-timeout", default_value = "3000")]
    pub boot_timeout: u32,

    /// How long to wait for a sender when no program is installed, in ms
    #[structopt(long = "initial-timeout", default_value = "60000")]
    pub initial_timeout: u32,

    /// How long to wait for the start of a packet mid-transfer, in ms
    #[structopt(long = "packet-timeout", default_value = "2000")]
    pub packet_timeout: u32,

    /// How long to wait between bytes inside a packet, in ms
    #[structopt(long = "data-timeout", default_value = "500")]
    pub data_timeout: u32,

    /// How long the link must stay quiet when purging stale bytes, in ms
    #[structopt(long = "purge-timeout", default_value = "100")]
    pub purge_timeout: u32,

    /// How many times a packet is re-requested before the session aborts
    #[structopt(long = "retry", default_value = "10")]
    pub retry: u32,
}
