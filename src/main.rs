/*
 * Copyright (C) 2025 The Rbdvol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::process;
use std::sync::Arc;

use clap::Parser;

use rbdvol::rbdvol::cli::{Commands, RbdVol};
use rbdvol::rbdvol::logger::{self, set_log_format};
use rbdvol::rbdvol::rbd::RbdCli;
use rbdvol::rbdvol::server;
use rbdvol::rbdvol::volume::VolumeDriver;

#[tokio::main]
async fn main() {
    let cli = RbdVol::parse();

    match cli.command {
        Commands::Serve(args) => {
            set_log_format(args.log_format.into());
            let config = args.driver_config();
            let rbd = Arc::new(RbdCli::new(
                config.user.clone(),
                config.cluster_config.clone(),
                config.shell_timeout,
            ));
            let driver = Arc::new(VolumeDriver::new(config, rbd));

            if let Err(err) = server::serve(driver).await {
                logger::error("server", "Volume plugin exited with error")
                    .err(&err)
                    .emit();
                process::exit(1);
            }
        }
    }
}
