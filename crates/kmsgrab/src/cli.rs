use std::path::PathBuf;

static HELP_STR_ELEVATE: &str = "
    Program that starts the helper with elevated privileges, e.g. pkexec. \
                                 Not needed when the helper binary has \
                                 cap_sys_admin set through setcap. Example \
                                 value: \"pkexec\"
";

#[derive(clap::Parser)]
#[command(
    name = "kmsgrab",
    version,
    about = "kmsgrab",
    long_about = "Lists the framebuffers a DRM device is currently scanning \
                  out, as seen by the privileged kmsgrab-send helper, and \
                  shows how each would be imported as a dma-buf"
)]
pub enum Args {
    List {
        #[arg(
            long,
            short,
            value_name = "DEVICE",
            help = "DRM card node to enumerate",
            default_value = "/dev/dri/card0"
        )]
        device: PathBuf,

        #[arg(
            long,
            short,
            value_name = "RUNTIME_DIR",
            help = "Directory for the rendezvous socket. If not provided, \
                    $XDG_RUNTIME_DIR/kmsgrab is used"
        )]
        runtime_dir: Option<PathBuf>,

        #[arg(
            long,
            value_name = "HELPER_DIR",
            help = "Directory containing kmsgrab-send. If not provided, the \
                    directory of this executable is used"
        )]
        helper_dir: Option<PathBuf>,

        #[arg(long, short, value_name = "WRAPPER", help = HELP_STR_ELEVATE)]
        elevate: Option<String>,

        #[arg(
            long,
            value_name = "SECONDS",
            help = "How long to wait for the helper to connect",
            default_value = "5"
        )]
        accept_timeout_secs: u64,

        #[arg(
            long,
            short,
            value_name = "FB_ID",
            help = "Framebuffer to select and describe, decimal or 0x hex. \
                    Example value: 0x2a",
            value_parser = parse_fb_id
        )]
        select: Option<u32>,

        #[arg(
            long,
            short = 'l',
            value_name = "LOG_PATH",
            help = "Optional log path value, shared with the helper. If not \
                    provided, logs go to stderr"
        )]
        log_path: Option<PathBuf>,
    },
}

impl Args {
    pub fn log_path(&self) -> Option<&std::path::Path> {
        match self {
            Args::List { log_path, .. } => log_path.as_deref(),
        }
    }
}

pub fn parse_fb_id(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid framebuffer id {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_parse_fb_id() {
        assert_eq!(parse_fb_id("0x2a"), Ok(42));
        assert_eq!(parse_fb_id("42"), Ok(42));
        assert!(parse_fb_id("0xzz").is_err());
    }

    #[test]
    fn test_list_defaults() {
        let args = Args::try_parse_from(["kmsgrab", "list"]).expect("parses");
        let Args::List {
            device,
            accept_timeout_secs,
            select,
            ..
        } = args;
        assert_eq!(device, PathBuf::from("/dev/dri/card0"));
        assert_eq!(accept_timeout_secs, 5);
        assert_eq!(select, None);
    }

    #[test]
    fn test_list_flags() {
        let args = Args::try_parse_from([
            "kmsgrab", "list", "-d", "/dev/dri/card1", "-e", "pkexec",
            "--select", "0x10", "-l", "/tmp/k.log",
        ])
        .expect("parses");
        assert_eq!(args.log_path(), Some(std::path::Path::new("/tmp/k.log")));
        let Args::List {
            device,
            elevate,
            select,
            ..
        } = args;
        assert_eq!(device, PathBuf::from("/dev/dri/card1"));
        assert_eq!(elevate.as_deref(), Some("pkexec"));
        assert_eq!(select, Some(16));
    }
}
