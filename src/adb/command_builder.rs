// ADB Command Builder - Typed builder for ADB commands
// Constructs argument lists for the bridge operations without string
// concatenation at call sites.

/// The ADB invocations the bridge driver issues.
#[derive(Debug, Clone)]
pub enum AdbCommand {
    Version,
    Devices { long: bool },
    TrackDevices,
    Push { local: String, remote: String },
    Forward { host_port: u16, abstract_socket: String },
    ForwardRemove { host_port: u16 },
    GetProp(String),
    Shell(Vec<String>),
    /// `app_process` launch of a pushed jar.
    AppProcess {
        classpath: String,
        main_class: String,
        args: Vec<String>,
    },
}

impl AdbCommand {
    /// Convert the command into a vector of arguments for the ADB process
    pub fn to_args(&self) -> Vec<String> {
        match self {
            AdbCommand::Version => vec!["version".into()],
            AdbCommand::Devices { long } => {
                let mut args = vec!["devices".into()];
                if *long {
                    args.push("-l".into());
                }
                args
            }
            AdbCommand::TrackDevices => vec!["track-devices".into()],
            AdbCommand::Push { local, remote } => {
                vec!["push".into(), local.clone(), remote.clone()]
            }
            AdbCommand::Forward {
                host_port,
                abstract_socket,
            } => vec![
                "forward".into(),
                format!("tcp:{host_port}"),
                format!("localabstract:{abstract_socket}"),
            ],
            AdbCommand::ForwardRemove { host_port } => vec![
                "forward".into(),
                "--remove".into(),
                format!("tcp:{host_port}"),
            ],
            AdbCommand::GetProp(prop) => {
                vec!["shell".into(), "getprop".into(), prop.clone()]
            }
            AdbCommand::Shell(shell_args) => {
                let mut args = vec!["shell".into()];
                args.extend(shell_args.iter().cloned());
                args
            }
            AdbCommand::AppProcess {
                classpath,
                main_class,
                args: process_args,
            } => {
                // Single shell word: CLASSPATH=<jar> app_process / <main> <args...>
                let mut shell_cmd = format!("CLASSPATH={classpath} app_process / {main_class}");
                for a in process_args {
                    shell_cmd.push(' ');
                    shell_cmd.push_str(a);
                }
                vec!["shell".into(), shell_cmd]
            }
        }
    }
}

/// Builder for constructing ADB commands targeting specific devices
pub struct AdbCommandBuilder {
    serial: Option<String>,
}

impl AdbCommandBuilder {
    pub fn new() -> Self {
        Self { serial: None }
    }

    /// Target a specific device by its serial.
    pub fn target(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Construct the full argument list including device targeting.
    pub fn build(&self, command: AdbCommand) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref serial) = self.serial {
            args.push("-s".into());
            args.push(serial.clone());
        }
        args.extend(command.to_args());
        args
    }
}

impl Default for AdbCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_to_args() {
        let cmd = AdbCommand::Devices { long: true };
        assert_eq!(cmd.to_args(), vec!["devices", "-l"]);
    }

    #[test]
    fn builder_with_device() {
        let builder = AdbCommandBuilder::new().target("emulator-5554");
        let args = builder.build(AdbCommand::Forward {
            host_port: 0,
            abstract_socket: "droidcast_emulator5554".into(),
        });
        assert_eq!(
            args,
            vec![
                "-s",
                "emulator-5554",
                "forward",
                "tcp:0",
                "localabstract:droidcast_emulator5554"
            ]
        );
    }

    #[test]
    fn app_process_is_one_shell_word() {
        let args = AdbCommand::AppProcess {
            classpath: "/data/local/tmp/screen-agent.jar".into(),
            main_class: "com.droidcast.agent.Server".into(),
            args: vec!["max_size=720".into(), "max_fps=30".into()],
        }
        .to_args();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], "shell");
        assert_eq!(
            args[1],
            "CLASSPATH=/data/local/tmp/screen-agent.jar app_process / \
             com.droidcast.agent.Server max_size=720 max_fps=30"
        );
    }

    #[test]
    fn forward_remove_args() {
        let args = AdbCommand::ForwardRemove { host_port: 27183 }.to_args();
        assert_eq!(args, vec!["forward", "--remove", "tcp:27183"]);
    }
}
