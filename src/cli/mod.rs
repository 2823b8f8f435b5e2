//! Command handlers for the `skillgate` binary.

mod common;
mod manage;
mod run;

pub(crate) use common::load_config;
pub(crate) use manage::{
    cmd_activate, cmd_approve, cmd_audit, cmd_bind, cmd_deprecate, cmd_install, cmd_list,
    cmd_parse_source, cmd_reject, cmd_sync_builtins, cmd_validate, cmd_versions, BindArgs,
};
pub(crate) use run::{cmd_run, RunArgs};
