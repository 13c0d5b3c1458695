use clap::Parser;
use outlook_pff::PffFile;

mod args;

fn main() -> anyhow::Result<()> {
    let args = args::Args::try_parse()?;

    let pff = PffFile::open(&args.file)?;
    let header = pff.header();

    println!("File Type: {:?}", header.file_type());
    println!("Content Type: {:?}", header.content_type());
    println!("Data Version: 0x{:04X}", header.data_version());
    println!("Content Version: 0x{:04X}", header.content_version());
    println!("Encryption Type: {:?}", header.encryption_type());
    println!("File Size: {}", header.file_size());
    println!(
        "Descriptor Index Root: {:?}",
        header.descriptor_index_root()
    );
    println!("Offset Index Root: {:?}", header.offset_index_root());
    println!("Allocation Table Valid: {}", header.allocation_table_valid());

    Ok(())
}
