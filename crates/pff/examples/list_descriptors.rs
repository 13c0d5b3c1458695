use clap::Parser;
use outlook_pff::{PffFile, PffOptions};

mod args;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = args::Args::try_parse()?;

    let options = PffOptions {
        tolerate_checksum_errors: true,
        ..PffOptions::default()
    };
    let pff = PffFile::open_with_options(&args.file, options)?;

    for descriptor in pff.descriptors() {
        let descriptor = descriptor?;
        print!(
            "0x{:08X} parent 0x{:08X} data 0x{:X}",
            descriptor.descriptor_id(),
            descriptor.parent_descriptor_id(),
            descriptor.data_id(),
        );
        match descriptor.stream() {
            Ok(stream) => println!(" ({} bytes)", stream.len()),
            Err(err) => println!(" (unreadable: {err})"),
        }
    }

    for descriptor in pff.recovered_descriptors()? {
        println!(
            "recovered 0x{:08X} data 0x{:X}",
            descriptor.descriptor_id(),
            descriptor.data_id(),
        );
    }

    Ok(())
}
