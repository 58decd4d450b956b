use std::sync::Arc;

use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;
use ports::secondary::socket_diag_port::{SocketDiagPort, SocketDiagSession};

use crate::command::CommandRunner;
use crate::routing::rules::Fwmark;

/// [`SocketDiagPort`] backed by `ss -K`.
///
/// Sockets are selected by fwmark: one kill pass per permission value that
/// does not satisfy the required permission.
pub struct SsSocketReaper {
    ss_binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl SsSocketReaper {
    pub fn new(ss_binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ss_binary: ss_binary.into(),
            runner,
        }
    }
}

impl SocketDiagPort for SsSocketReaper {
    fn open(&self) -> Result<Box<dyn SocketDiagSession>, KernelError> {
        self.runner.run(&self.ss_binary, &["-V".to_string()])?;
        Ok(Box::new(SsSession {
            ss_binary: self.ss_binary.clone(),
            runner: Arc::clone(&self.runner),
        }))
    }
}

struct SsSession {
    ss_binary: String,
    runner: Arc<dyn CommandRunner>,
}

fn kill_args(net_id: NetId, held: Permission, exclude_loopback: bool) -> Vec<String> {
    let mark = Fwmark::network(net_id, false, Some(held));
    // Compare net id and permission bits only; the explicit bit may be set
    // or clear.
    let mut args: Vec<String> = ["-K", "-H", "-n", "-t", "state", "connected", "fwmark", "="]
        .into_iter()
        .map(str::to_string)
        .collect();
    args.push(mark.render());
    if exclude_loopback {
        for dst in ["127.0.0.0/8", "[::1]"] {
            args.extend(["and", "not", "dst", dst].map(str::to_string));
        }
    }
    args
}

impl SocketDiagSession for SsSession {
    fn destroy_sockets_lacking_permission(
        &mut self,
        net_id: NetId,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<usize, KernelError> {
        let mut closed = 0;
        let mut outcome = Ok(());
        for held in Permission::ALL
            .into_iter()
            .filter(|held| !held.satisfies(permission))
        {
            match self
                .runner
                .run(&self.ss_binary, &kill_args(net_id, held, exclude_loopback))
            {
                Ok(stdout) => closed += stdout.lines().filter(|l| !l.trim().is_empty()).count(),
                Err(e) => outcome = outcome.and(Err(e)),
            }
        }
        outcome.map(|()| closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;

    fn killed(line: &str) -> Result<String, KernelError> {
        if line.contains("0x64/0xcffff") {
            Ok("ESTAB 0 0 10.0.0.2:40000 1.1.1.1:443\nESTAB 0 0 10.0.0.2:40001 1.1.1.1:443\n".to_string())
        } else {
            Ok(String::new())
        }
    }

    #[test]
    fn open_checks_binary() {
        let runner = Arc::new(RecordingRunner::ok());
        let reaper = SsSocketReaper::new("ss", runner.clone());
        reaper.open().unwrap();
        assert_eq!(runner.lines(), ["ss -V"]);
    }

    #[test]
    fn open_failure_is_reported() {
        let runner = Arc::new(RecordingRunner::with(|_| {
            Err(KernelError::new("ss", "spawn failed: not found"))
        }));
        let reaper = SsSocketReaper::new("ss", runner);
        assert!(reaper.open().is_err());
    }

    #[test]
    fn system_requirement_kills_none_and_network_holders() {
        let runner = Arc::new(RecordingRunner::with(killed));
        let reaper = SsSocketReaper::new("ss", runner.clone());
        let mut session = reaper.open().unwrap();
        runner.clear();

        let closed = session
            .destroy_sockets_lacking_permission(NetId(100), Permission::System, true)
            .unwrap();

        assert_eq!(closed, 2);
        assert_eq!(
            runner.lines(),
            [
                "ss -K -H -n -t state connected fwmark = 0x64/0xcffff and not dst 127.0.0.0/8 and not dst [::1]",
                "ss -K -H -n -t state connected fwmark = 0x40064/0xcffff and not dst 127.0.0.0/8 and not dst [::1]",
            ]
        );
    }

    #[test]
    fn network_requirement_only_kills_none_holders() {
        let runner = Arc::new(RecordingRunner::ok());
        let reaper = SsSocketReaper::new("ss", runner.clone());
        let mut session = reaper.open().unwrap();
        runner.clear();

        session
            .destroy_sockets_lacking_permission(NetId(100), Permission::Network, false)
            .unwrap();

        assert_eq!(
            runner.lines(),
            ["ss -K -H -n -t state connected fwmark = 0x64/0xcffff"]
        );
    }

    #[test]
    fn first_failure_is_returned_after_all_passes() {
        let runner = Arc::new(RecordingRunner::with(|line| {
            if line.contains("-K") {
                Err(KernelError::new("ss", "Operation not permitted").with_code(1))
            } else {
                Ok(String::new())
            }
        }));
        let reaper = SsSocketReaper::new("ss", runner.clone());
        let mut session = reaper.open().unwrap();

        let err = session
            .destroy_sockets_lacking_permission(NetId(100), Permission::System, true)
            .unwrap_err();

        assert_eq!(err.code, Some(1));
        assert_eq!(runner.lines().len(), 3);
    }
}
