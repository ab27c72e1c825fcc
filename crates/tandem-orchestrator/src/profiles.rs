use crate::types::AgentSpec;

/// Built-in specialist agents, used when the configuration declares none.
/// Order matters: it is the tie-break order for assignment.
pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        frontend_agent(),
        backend_agent(),
        database_agent(),
        testing_agent(),
        devops_agent(),
    ]
}

fn frontend_agent() -> AgentSpec {
    AgentSpec::new(
        "frontend",
        "Frontend Specialist",
        ["frontend", "react", "css", "html", "layout"],
    )
    .with_working_dir("work-frontend")
}

fn backend_agent() -> AgentSpec {
    AgentSpec::new(
        "backend",
        "Backend Specialist",
        ["backend", "api", "server", "endpoint", "service"],
    )
    .with_working_dir("work-backend")
}

fn database_agent() -> AgentSpec {
    AgentSpec::new(
        "database",
        "Database Specialist",
        ["database", "schema", "sql", "migration", "model"],
    )
    .with_working_dir("work-database")
}

fn testing_agent() -> AgentSpec {
    AgentSpec::new(
        "testing",
        "Testing Specialist",
        ["testing", "test", "e2e", "fixture"],
    )
    .with_working_dir("work-testing")
}

fn devops_agent() -> AgentSpec {
    AgentSpec::new(
        "devops",
        "DevOps Specialist",
        ["devops", "deploy", "docker", "pipeline", "infra"],
    )
    .with_working_dir("work-devops")
}
