//! HFS Volume Tool
//!
//! Inspect and edit classic HFS disk images from the command line.

use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use serde::Serialize;

use hfsvol::config::get_config;
use hfsvol::hfs::{HfsError, HfsVolume};

const USAGE: &str = "usage: hfsvol <image> <command> [args]

commands:
  info                  volume attributes
  ls [path]             list a folder
  stat <path>           item attributes
  cat <path>            write a file's data fork to stdout
  put <local> <path>    copy a local file into the volume
  mkdir <path>          create a folder
  rm <path>             remove a file or empty folder
  mv <from> <to>        move or rename an item
  rename-volume <name>  change the volume name
  format                create an empty volume (creates the image if missing)
  check                 verify B-trees and the allocation bitmap";

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [image, command, rest @ ..] = args.as_slice() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    match run(Path::new(image), command, rest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hfsvol: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(image: &Path, command: &str, args: &[String]) -> Result<(), Box<dyn Error>> {
    let config = get_config().clone();

    if command == "format" {
        let volume = HfsVolume::format_and_mount_with_config(image, config)?;
        print_json(&volume.attributes_of_file_system())?;
        volume.unmount()?;
        return Ok(());
    }

    let volume = HfsVolume::mount_with_config(image, config)?;
    match (command, args) {
        ("info", []) => print_json(&volume.attributes_of_file_system())?,
        ("ls", []) => list(&volume, "/")?,
        ("ls", [path]) => list(&volume, path)?,
        ("stat", [path]) => print_json(&volume.attributes_of_item(path)?)?,
        ("cat", [path]) => {
            let size = volume.attributes_of_item(path)?.size;
            let data = volume.read_file(path, 0, size)?;
            std::io::stdout().write_all(&data)?;
        }
        ("put", [local, path]) => {
            let data = std::fs::read(local)?;
            match volume.attributes_of_item(path) {
                Ok(item) if item.is_file() => volume.truncate(path, 0)?,
                Ok(_) => return Err(HfsError::IsADirectory(path.clone()).into()),
                Err(HfsError::PathNotFound(_)) => {
                    volume.create_file(path)?;
                }
                Err(err) => return Err(err.into()),
            }
            volume.write_file(path, 0, &data)?;
            log::info!("Copied {} bytes from {} to {}", data.len(), local, path);
        }
        ("mkdir", [path]) => {
            volume.create_directory(path)?;
        }
        ("rm", [path]) => volume.remove_item(path)?,
        ("mv", [from, to]) => {
            volume.move_item(from, to)?;
        }
        ("rename-volume", [name]) => volume.set_volume_name(name)?,
        ("check", []) => {
            let report = volume.check_consistency()?;
            print_json(&report)?;
            if !report.is_consistent() {
                return Err("volume is inconsistent".into());
            }
        }
        _ => {
            return Err(format!("unknown command \"{} {}\"\n\n{}", command, args.join(" "), USAGE).into());
        }
    }

    volume.unmount()?;
    Ok(())
}

fn list(volume: &HfsVolume, path: &str) -> Result<(), Box<dyn Error>> {
    for item in volume.contents_of_directory(path)? {
        let kind = if item.is_directory() { "dir" } else { "file" };
        println!("{:<4} {:>10} {}", kind, item.size_string(), item.name);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
