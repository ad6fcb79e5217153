//! Frontend Command Handler
//!
//! Maps the command byte of an authenticated client's frame to the
//! operation on its [`FrontendConnection`]. Every branch first bumps the
//! processor's [`CommandCount`](crate::commands::CommandCount).
//!
//! ## Dispatch Table
//!
//! ```text
//! frame[4]
//!   0x02 COM_INIT_DB       -> init_db
//!   0x03 COM_QUERY         -> query
//!   0x0e COM_PING          -> ping
//!   0x01 COM_QUIT          -> close
//!   0x0c COM_PROCESS_KILL  -> kill
//!   0x16 COM_STMT_PREPARE  -> stmt_prepare
//!   0x17 COM_STMT_EXECUTE  -> stmt_execute
//!   0x19 COM_STMT_CLOSE    -> stmt_close
//!   0x40 COM_HEARTBEAT     -> heartbeat
//!   other                  -> ER_UNKNOWN_COM_ERROR, connection stays open
//! ```

use crate::commands::CommandCount;
use crate::net::connection::NioConnection;
use crate::net::frontend::FrontendConnection;
use crate::protocol::types::{error_code, Command, HEADER_SIZE};
use tracing::trace;

/// Dispatches command frames for one frontend connection.
pub struct FrontendCommandHandler<'a> {
    source: &'a FrontendConnection,
}

impl<'a> FrontendCommandHandler<'a> {
    pub fn new(source: &'a FrontendConnection) -> Self {
        Self { source }
    }

    fn count(&self, f: impl FnOnce(&CommandCount)) {
        if let Some(processor) = self.source.core().processor() {
            f(processor.command_count());
        }
    }

    /// Handles one complete frame, header included.
    pub fn handle(&self, frame: &[u8]) -> anyhow::Result<()> {
        let source = self.source;
        let command = frame.get(HEADER_SIZE).copied().and_then(Command::from_byte);
        trace!(conn = source.id(), command = ?command, "Dispatching command");

        match command {
            Some(Command::InitDb) => {
                self.count(CommandCount::do_init_db);
                source.init_db(frame)
            }
            Some(Command::Query) => {
                self.count(CommandCount::do_query);
                source.query(frame)
            }
            Some(Command::Ping) => {
                self.count(CommandCount::do_ping);
                source.ping();
                Ok(())
            }
            Some(Command::Quit) => {
                self.count(CommandCount::do_quit);
                source.close();
                Ok(())
            }
            Some(Command::ProcessKill) => {
                self.count(CommandCount::do_kill);
                source.kill(frame)
            }
            Some(Command::StmtPrepare) => {
                self.count(CommandCount::do_stmt_prepare);
                source.stmt_prepare(frame)
            }
            Some(Command::StmtExecute) => {
                self.count(CommandCount::do_stmt_execute);
                source.stmt_execute(frame)
            }
            Some(Command::StmtClose) => {
                self.count(CommandCount::do_stmt_close);
                source.stmt_close(frame)
            }
            Some(Command::Heartbeat) => {
                self.count(CommandCount::do_heartbeat);
                source.heartbeat(frame)
            }
            None => {
                self.count(CommandCount::do_other);
                source.write_err_message(1, error_code::ER_UNKNOWN_COM_ERROR, "Unknown command");
                Ok(())
            }
        }
    }
}
