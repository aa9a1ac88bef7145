//! System-service lifecycle bridge.
//!
//! On Windows the four lifecycle commands talk to the service control
//! manager and the process can run under the dispatcher as a registered
//! service. Every other platform gets a stub that reports the fixed
//! unsupported error, so the core never sees platform types.

use crate::cli::ServiceCommand;
use rdpforward_config::Config;
use std::fmt;

pub const SERVICE_NAME: &str = "RDPForwardBySNI";
pub const SERVICE_DISPLAY_NAME: &str = "RDP Forward by SNI";
pub const SERVICE_DESCRIPTION: &str = "基于SNI的RDP协议转发服务";

/// Log file created beside the executable when service mode is entered
/// without an explicit `log_file`.
pub const SERVICE_LOG_FILE: &str = "rdp-forward.log";

#[derive(Debug)]
pub enum ServiceError {
    /// This platform has no service controller.
    Unsupported,
    /// `install` found an existing registration.
    AlreadyExists,
    /// `stop` polled past its deadline without reaching the stopped state.
    StopTimeout,
    Io(std::io::Error),
    /// The forwarder failed while running in service mode.
    Run(String),
    #[cfg(windows)]
    Controller(windows_service::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Unsupported => write!(f, "Windows服务功能仅在Windows平台可用"),
            ServiceError::AlreadyExists => write!(f, "服务已经存在"),
            ServiceError::StopTimeout => write!(f, "停止服务超时"),
            ServiceError::Io(e) => write!(f, "服务命令执行失败: {}", e),
            ServiceError::Run(e) => write!(f, "运行服务失败: {}", e),
            #[cfg(windows)]
            ServiceError::Controller(e) => write!(f, "服务管理器操作失败: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

#[cfg(windows)]
impl From<windows_service::Error> for ServiceError {
    fn from(err: windows_service::Error) -> Self {
        ServiceError::Controller(err)
    }
}

/// Dispatches one `--service` command against the platform controller.
pub fn handle_command(command: ServiceCommand, config: &Config) -> Result<(), ServiceError> {
    match command {
        ServiceCommand::Install => platform::install(config),
        ServiceCommand::Uninstall => platform::uninstall(),
        ServiceCommand::Start => platform::start(),
        ServiceCommand::Stop => platform::stop(),
    }
}

/// Attempts to run under the platform service dispatcher.
///
/// Returns `Ok(true)` when the process was launched by the service
/// controller and has now finished serving, `Ok(false)` when it was started
/// from a console and should run interactively instead.
pub fn run_dispatcher(config: Config) -> Result<bool, ServiceError> {
    platform::run_dispatcher(config)
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::ffi::OsString;
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};
    use windows_service::service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
    use windows_service::service_dispatcher;
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

    const STOP_TIMEOUT: Duration = Duration::from_secs(10);
    const STOP_POLL_INTERVAL: Duration = Duration::from_millis(300);

    /// Raised by `StartServiceCtrlDispatcher` when the process was not
    /// launched by the service controller.
    const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: i32 = 1063;

    static SERVICE_CONFIG: OnceLock<Config> = OnceLock::new();

    windows_service::define_windows_service!(ffi_service_main, service_main);

    pub fn install(config: &Config) -> Result<(), ServiceError> {
        let manager = ServiceManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )?;

        if manager
            .open_service(SERVICE_NAME, ServiceAccess::QUERY_STATUS)
            .is_ok()
        {
            return Err(ServiceError::AlreadyExists);
        }

        let executable_path = std::env::current_exe().map_err(ServiceError::Io)?;

        let mut launch_arguments: Vec<OsString> = vec![
            "--listen".into(),
            config.listen.clone().into(),
            "--target".into(),
            config.target.clone().into(),
        ];
        if !config.sni_whitelist.is_empty() {
            launch_arguments.push("--sni".into());
            launch_arguments.push(config.sni_whitelist.to_string().into());
        }
        if !config.client_whitelist.is_empty() {
            launch_arguments.push("--client-whitelist".into());
            launch_arguments.push(config.client_whitelist.to_string().into());
        }
        if config.debug {
            launch_arguments.push("--debug".into());
        }

        let info = ServiceInfo {
            name: SERVICE_NAME.into(),
            display_name: SERVICE_DISPLAY_NAME.into(),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: executable_path.clone(),
            launch_arguments,
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        let service = manager.create_service(&info, ServiceAccess::CHANGE_CONFIG)?;
        service.set_description(SERVICE_DESCRIPTION)?;

        println!("服务 '{}' 安装成功", SERVICE_DISPLAY_NAME);
        print!("启动参数: --listen {} --target {}", config.listen, config.target);
        if !config.sni_whitelist.is_empty() {
            print!(" --sni {}", config.sni_whitelist);
        }
        if !config.client_whitelist.is_empty() {
            print!(" --client-whitelist {}", config.client_whitelist);
        }
        if config.debug {
            print!(" --debug");
        }
        println!();
        println!(
            "服务日志文件: {}",
            executable_path.with_file_name(SERVICE_LOG_FILE).display()
        );

        Ok(())
    }

    pub fn uninstall() -> Result<(), ServiceError> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::DELETE)?;
        service.delete()?;
        println!("服务 '{}' 卸载成功", SERVICE_DISPLAY_NAME);
        Ok(())
    }

    pub fn start() -> Result<(), ServiceError> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(SERVICE_NAME, ServiceAccess::START)?;
        service.start::<&str>(&[])?;
        println!("服务 '{}' 启动成功", SERVICE_DISPLAY_NAME);
        Ok(())
    }

    pub fn stop() -> Result<(), ServiceError> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        let service = manager.open_service(
            SERVICE_NAME,
            ServiceAccess::STOP | ServiceAccess::QUERY_STATUS,
        )?;

        let mut status = service.stop()?;
        let deadline = Instant::now() + STOP_TIMEOUT;
        while status.current_state != ServiceState::Stopped {
            if Instant::now() > deadline {
                return Err(ServiceError::StopTimeout);
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
            status = service.query_status()?;
        }

        println!("服务 '{}' 停止成功", SERVICE_DISPLAY_NAME);
        Ok(())
    }

    pub fn run_dispatcher(config: Config) -> Result<bool, ServiceError> {
        let _ = SERVICE_CONFIG.set(config);
        match service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
            Ok(()) => Ok(true),
            Err(windows_service::Error::Winapi(err))
                if err.raw_os_error() == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT) =>
            {
                Ok(false)
            }
            Err(e) => Err(ServiceError::Controller(e)),
        }
    }

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_service() {
            eprintln!("{}", e);
        }
    }

    fn run_service() -> Result<(), ServiceError> {
        let mut config = SERVICE_CONFIG
            .get()
            .cloned()
            .ok_or_else(|| ServiceError::Run("服务配置缺失".to_string()))?;

        // Under the controller there is no console; default the log file to
        // a fixed name beside the executable.
        if config.log_file.is_none()
            && let Ok(exe) = std::env::current_exe()
        {
            config.log_file = Some(exe.with_file_name(SERVICE_LOG_FILE));
        }
        crate::logging::init(&config);

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
        let status_handle =
            service_control_handler::register(SERVICE_NAME, move |control| match control {
                ServiceControl::Stop | ServiceControl::Shutdown => {
                    let _ = shutdown_tx.send(());
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            })?;

        let running_status = ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: ServiceState::Running,
            controls_accepted: ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        };
        status_handle.set_service_status(running_status)?;

        let runtime = tokio::runtime::Runtime::new().map_err(ServiceError::Io)?;
        let result = runtime
            .block_on(rdpforward_core::run_forwarder(config, shutdown_rx))
            .map_err(|e| ServiceError::Run(e.to_string()));

        let stopped_status = ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: ServiceState::Stopped,
            controls_accepted: ServiceControlAccept::empty(),
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        };
        status_handle.set_service_status(stopped_status)?;

        result
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub fn install(_config: &Config) -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported)
    }

    pub fn uninstall() -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported)
    }

    pub fn start() -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported)
    }

    pub fn stop() -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported)
    }

    pub fn run_dispatcher(_config: Config) -> Result<bool, ServiceError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_identity() {
        assert_eq!(SERVICE_NAME, "RDPForwardBySNI");
        assert_eq!(SERVICE_DISPLAY_NAME, "RDP Forward by SNI");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_commands_unsupported_off_windows() {
        let config = Config::default();
        for command in [
            ServiceCommand::Install,
            ServiceCommand::Uninstall,
            ServiceCommand::Start,
            ServiceCommand::Stop,
        ] {
            let err = handle_command(command, &config).unwrap_err();
            assert!(matches!(err, ServiceError::Unsupported));
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn test_dispatcher_is_a_no_op_off_windows() {
        assert_eq!(run_dispatcher(Config::default()).unwrap(), false);
    }
}
