/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Command Line Interface
use once_cell::sync::Lazy;

/// The parsed command-line arguments provided to this program. Lazily initialized.
///
/// # Exits
///
/// Exits if [`argh::from_env`] would exit--for example, if the `--help` flag was provided or the
/// program arguments could not be parsed.
pub static PARSED_COMMANDS: Lazy<TopLevel> = Lazy::new(argh::from_env);

/// Toplevel CLI commands and options.
/// If no command is provided "serve" will be invoked with default options.
#[derive(argh::FromArgs, PartialEq, Debug)]
pub struct TopLevel {
    /// subcommands
    #[argh(subcommand)]
    pub subcommand: Option<Command>,
}

/// Subcommands
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Command {
    /// starts the daemon.
    Serve(Serve),

    /// prints the daemon version to stdout.
    Version(Version),
}

/// Starts the resource-management daemon. This is the default command when no
/// command is provided.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "serve")]
pub struct Serve {
    /// TCP port to listen on. Defaults to 9763.
    #[argh(option, short = 'p')]
    pub port: Option<u16>,
    /// path to the xrm.ini configuration file; defaults to searching next
    /// to the executable, then the current directory.
    #[argh(option, short = 'c')]
    pub config: Option<String>,
    /// disable crash-recovery snapshotting.
    #[argh(switch)]
    pub no_snapshot: bool,
}

impl Default for Serve {
    fn default() -> Serve {
        Serve {
            port: None,
            config: None,
            no_snapshot: false,
        }
    }
}

/// Prints the daemon version to stdout.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "version")]
pub struct Version {}

#[cfg(test)]
#[rustfmt::skip]
mod test {
    use super::*;
    use argh::FromArgs;

    #[test]
    fn version() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["version"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Version(Version {}))
            }
        );
    }

    #[test]
    fn serve_with_port() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["serve", "-p", "9999"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    port: Some(9999),
                    config: None,
                    no_snapshot: false,
                }))
            }
        );
    }

    #[test]
    fn serve_no_snapshot() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["serve", "--no-snapshot"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    port: None,
                    config: None,
                    no_snapshot: true,
                }))
            }
        );
    }

    #[test]
    fn no_subcommand_defaults_to_none() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &[]).expect("from_args failed"),
            TopLevel { subcommand: None }
        );
    }
}
