//! Built-in command handlers, one module per role class.

pub mod integrator;
pub mod orchestrator;
pub mod role;

use crate::grammar::RoleClass;
use crate::router::Router;

/// Register every built-in handler. Each name here must also be in
/// [`RoleClass::commands`] or `validate` rejects it before dispatch.
pub fn register_all(router: &mut Router) {
    router.register(RoleClass::Orchestrator, "start_workflow", orchestrator::start_workflow);
    router.register(RoleClass::Orchestrator, "generate_iteration", orchestrator::generate_iteration);
    router.register(RoleClass::Orchestrator, "launch_agents", orchestrator::launch_agents);
    router.register(RoleClass::Orchestrator, "apply_ready_to", orchestrator::apply_ready_to);
    router.register(RoleClass::Orchestrator, "archive_tasks", orchestrator::archive_tasks);
    router.register(RoleClass::Orchestrator, "monitor_progress", orchestrator::monitor_progress);

    router.register(RoleClass::Integrator, "apply_ready", integrator::apply_ready);
    router.register(RoleClass::Integrator, "check_conflicts", integrator::check_conflicts);
    router.register(RoleClass::Integrator, "distribute_tasks", integrator::distribute_tasks);

    router.register(RoleClass::Role, "start_task", role::start_task);
    router.register(RoleClass::Role, "start_next", role::start_next);
    router.register(RoleClass::Role, "report_token_usage", role::report_token_usage);
}
