use clap::{Parser, ValueEnum};
use rdpforward_config::{Config, ConfigError, Whitelist};
use std::path::PathBuf;

/// Command-line surface. Precedence: flags override the configuration file,
/// which overrides built-in defaults; whitelist flags replace (not merge
/// with) the file-provided sets.
#[derive(Debug, Parser)]
#[command(name = "rdpforward", version, about = "基于SNI的RDP协议转发服务", long_about = None)]
pub struct Args {
    /// 监听端口
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// 目标地址
    #[arg(long, value_name = "HOST:PORT")]
    pub target: Option<String>,

    /// SNI白名单（TLS连接的目标域名/IP），逗号分隔
    #[arg(long, value_name = "CSV")]
    pub sni: Option<String>,

    /// 客户端计算机名白名单（非TLS连接），逗号分隔
    #[arg(long = "client-whitelist", value_name = "CSV")]
    pub client_whitelist: Option<String>,

    /// 调试模式（显示详细数据包信息）
    #[arg(long)]
    pub debug: bool,

    /// 配置文件路径（JSON格式）
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// 服务命令
    #[arg(long, value_enum, value_name = "COMMAND")]
    pub service: Option<ServiceCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceCommand {
    Install,
    Uninstall,
    Start,
    Stop,
}

/// Builds the frozen runtime configuration from the optional file plus flag
/// overrides.
pub fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(target) = &args.target {
        config.target = target.clone();
    }
    if args.debug {
        config.debug = true;
    }
    if let Some(csv) = &args.sni {
        config.sni_whitelist = Whitelist::from_csv(csv);
    }
    if let Some(csv) = &args.client_whitelist {
        config.client_whitelist = Whitelist::from_csv(csv);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_from(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = build_config(&args_from(&["rdpforward"])).unwrap();
        assert_eq!(config.listen, ":3389");
        assert!(config.target.is_empty());
        assert!(!config.debug);
    }

    #[test]
    fn test_flags_build_config() {
        let config = build_config(&args_from(&[
            "rdpforward",
            "--listen",
            ":13389",
            "--target",
            "10.0.0.2:3389",
            "--sni",
            "a.example,b.example",
            "--client-whitelist",
            "WORK-PC",
            "--debug",
        ]))
        .unwrap();
        assert_eq!(config.listen, ":13389");
        assert_eq!(config.target, "10.0.0.2:3389");
        assert!(config.sni_whitelist.contains("a.example"));
        assert!(config.sni_whitelist.contains("b.example"));
        assert!(config.client_whitelist.contains("WORK-PC"));
        assert!(config.debug);
    }

    #[test]
    fn test_service_command_parses() {
        let args = args_from(&["rdpforward", "--service", "install"]);
        assert_eq!(args.service, Some(ServiceCommand::Install));

        let args = args_from(&["rdpforward", "--service", "stop"]);
        assert_eq!(args.service, Some(ServiceCommand::Stop));
    }

    #[test]
    fn test_unknown_service_command_is_an_error() {
        assert!(Args::try_parse_from(["rdpforward", "--service", "restart"]).is_err());
    }
}
