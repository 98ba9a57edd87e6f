//! Lists a remote directory over SFTP, using a non-blocking socket.
//!
//! `sftpdir 127.0.0.1 username password /tmp/secretdir`

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use anyhow::{Context, Result};
use simplelog::*;

use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use dusk::{AuthMethod, Config, Credentials, HashKind, ReadEntry, Session, SftpChannel};

const WAIT: Duration = Duration::from_millis(5);

#[derive(argh::FromArgs)]
/** List a directory with SFTP
 */
struct Args {
    #[argh(switch, short = 'v')]
    /// verbose debug logging
    debug: bool,

    #[argh(switch)]
    /// more verbose
    trace: bool,

    #[argh(option, short = 'p', default = "22")]
    /// port
    port: u16,

    #[argh(option, short = 'i')]
    /// authenticate with a private key file, the password is its passphrase
    identityfile: Option<PathBuf>,

    #[argh(option)]
    /// public key file to check against the private key
    pubkey: Option<PathBuf>,

    #[argh(switch)]
    /// prompt for the password
    ask_password: bool,

    #[argh(switch)]
    /// wait in the library rather than retrying here
    blocking: bool,

    #[argh(positional, default = "String::from(\"127.0.0.1\")")]
    /// host
    host: String,

    #[argh(positional, default = "String::from(\"username\")")]
    /// username
    username: String,

    #[argh(positional, default = "String::from(\"password\")")]
    /// password, or key passphrase
    password: String,

    #[argh(positional, default = "String::from(\"/tmp/secretdir\")")]
    /// remote directory
    path: String,
}

fn setup_log(args: &Args) -> Result<()> {
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("dusk")
        .add_filter_allow_str("sftpdir")
        .build();

    let level = if args.trace {
        LevelFilter::Trace
    } else if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    TermLogger::init(level, conf, TerminalMode::Stderr, ColorChoice::Auto)
        .context("Failed setting up logging")
}

/// Retries a non-blocking call until it completes
fn again<R>(mut f: impl FnMut() -> dusk::Result<R>) -> dusk::Result<R> {
    loop {
        match f() {
            Err(dusk::Error::WouldBlock) => {
                trace!("Blocking");
                thread::sleep(WAIT)
            }
            r => return r,
        }
    }
}

fn print_entry(e: &dusk::DirEntry) {
    let a = &e.attrs;
    let mut line = String::new();
    if a.permissions.is_some() {
        line.push_str("--fix----- ");
    } else {
        line.push_str("---------- ");
    }

    match a.uidgid {
        Some(ids) => line.push_str(&format!("{:4} {:4} ", ids.uid, ids.gid)),
        None => line.push_str("   -    - "),
    }

    if let Some(size) = a.size {
        line.push_str(&format!("{size:8} "));
    }

    println!("{line}{}", e.name_lossy());
}

fn list(sess: &mut Session<TcpStream>, path: &str) -> Result<()> {
    info!("Starting SFTP");
    let mut sftp = loop {
        match SftpChannel::open(sess) {
            Err(dusk::Error::WouldBlock) => thread::sleep(WAIT),
            r => break r.context("Unable to init SFTP session")?,
        }
    };

    info!("Opening {path}");
    let dir = again(|| sftp.open_directory(path)).context("Unable to open dir with SFTP")?;
    info!("Directory opened, receiving listing");

    loop {
        match again(|| sftp.read_entry(&dir))? {
            ReadEntry::Entry(e) => print_entry(&e),
            ReadEntry::EndOfListing => break,
        }
    }
    again(|| sftp.close_directory(&dir))?;
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let tcp = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    tcp.set_nonblocking(true)?;

    let method =
        if args.identityfile.is_some() { AuthMethod::PublicKey } else { AuthMethod::Password };
    let conf =
        Config::new().hash_kind(HashKind::Md5).auth_method(method).blocking(args.blocking);

    let mut sess = Session::new(tcp, conf)?;
    again(|| sess.handshake()).context("Failure establishing SSH session")?;

    let fp = sess.host_fingerprint()?;
    let hex: String = fp.as_bytes().iter().map(|b| format!("{b:02X} ")).collect();
    println!("Fingerprint: {hex}");

    let password = if args.ask_password {
        rpassword::prompt_password(format!("{}@{}'s password: ", args.username, args.host))?
    } else {
        args.password.clone()
    };

    let creds = Credentials {
        username: &args.username,
        password: Some(&password),
        pubkey_path: args.pubkey.as_deref(),
        privkey_path: args.identityfile.as_deref(),
        passphrase: args.identityfile.as_ref().map(|_| password.as_str()),
    };
    if let Err(e) = again(|| sess.authenticate(&creds)) {
        match method {
            AuthMethod::Password => println!("Authentication by password failed."),
            AuthMethod::PublicKey => println!("\tAuthentication by public key failed"),
        }
        debug!("{e}");
    } else if let Err(e) = list(&mut sess, &args.path) {
        error!("{e:#}");
        println!("{e:#}");
    }

    again(|| sess.disconnect("Normal Shutdown, Thank you for playing"))?;
    println!("all done");
    Ok(())
}

fn try_main() -> Result<()> {
    let args: Args = argh::from_env();
    setup_log(&args)?;
    run(&args)
}

fn main() {
    if let Err(e) = try_main() {
        error!("Exit with error: {e:#}");
        eprintln!("{e:#}");
        std::process::exit(1)
    }
}
