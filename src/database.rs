use std::error::Error;
use std::fs::File;
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::error;

use crate::cmd_execute::{Cmd, CommandStreamActions, Executor};
use crate::config::{Config, DbCredentials};
use crate::status::Status;

fn mysql_args(host: &str, port: u16, user: &str, passwd: &str) -> Vec<String> {
    let mut args = vec![
        "-h".to_string(),
        host.to_string(),
        "-P".to_string(),
        port.to_string(),
        "-u".to_string(),
        user.to_string(),
    ];
    if !passwd.is_empty() {
        args.push(format!("-p{}", passwd));
    }
    args
}

/// Database names on one MySQL host, or None when it cannot be reached.
pub fn get_databases(host: &str, port: u16, user: &str, passwd: &str) -> Option<Vec<String>> {
    let cmd = Cmd::new("mysql")
        .args(mysql_args(host, port, user, passwd))
        .arg("--batch")
        .arg("--skip-column-names")
        .arg("-e")
        .arg("SHOW DATABASES");
    match cmd.execute_by_line() {
        Ok(names) => Some(names),
        Err(e) => {
            error!("listing databases on {}:{} failed: {}", host, port, e);
            None
        }
    }
}

/// Credentials for host:port, config file entries first, then the ones the
/// server pushed.
pub fn get_credentials<'a>(
    config: &'a Config,
    status: &'a Status,
    host: &str,
    port: u16,
) -> Option<&'a DbCredentials> {
    config
        .database
        .iter()
        .chain(status.database.iter())
        .find(|db| db.host == host && db.port == port)
}

/// Streams `mysqldump` output through gzip into `dest`.
pub fn dump(
    host: &str,
    port: u16,
    user: &str,
    passwd: &str,
    name: &str,
    dest: &Path,
) -> Result<(), Box<dyn Error>> {
    let cmd = Cmd::new("mysqldump")
        .args(mysql_args(host, port, user, passwd))
        .arg("--single-transaction")
        .arg(name);
    let mut child = cmd.spawn()?;
    let mut stdout = CommandStreamActions::stdout(&mut child);
    let mut encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    io::copy(&mut stdout, &mut encoder)?;
    encoder.finish()?;
    let exit = child.wait()?;
    if !exit.success() {
        return Err(format!("mysqldump of {} exited with {}", name, exit).into());
    }
    Ok(())
}

/// Feeds a gzipped dump file into `mysql` on the given host.
pub fn import(
    dump_path: &Path,
    host: &str,
    port: u16,
    user: &str,
    passwd: &str,
    name: &str,
) -> Result<(), Box<dyn Error>> {
    let cmd = Cmd::new("mysql")
        .args(mysql_args(host, port, user, passwd))
        .arg(name);
    let mut child = cmd.spawn_with_stdin()?;
    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no child stdin"))?;
        let mut decoder = GzDecoder::new(File::open(dump_path)?);
        io::copy(&mut decoder, &mut stdin)?;
    }
    let exit = child.wait()?;
    if !exit.success() {
        return Err(format!("mysql import of {} exited with {}", name, exit).into());
    }
    Ok(())
}

/// Splits `host_port_name[_timestamp...]` out of a dump basename.
pub fn parse_dump_name(basename: &str) -> Option<(String, u16, String)> {
    let mut parts = basename.splitn(4, '_');
    let host = parts.next()?.to_string();
    let port: u16 = parts.next()?.parse().ok()?;
    let name = parts.next()?.to_string();
    if host.is_empty() || name.is_empty() {
        return None;
    }
    Some((host, port, name))
}
