use gemcode_agent::{AgentLoop, LoopError};
use gemcode_core::{AgentConfig, Part, Role, ToolsConfig};
use gemcode_observe::Observer;
use gemcode_testkit::{
    FAKE_PROMPT_TOKENS, FAKE_RESPONSE_TOKENS, ScriptedModelClient, TestWorkspace, call_turn,
    exploration_script, malformed_turn, text_turn,
};
use gemcode_tools::ToolDispatcher;
use serde_json::json;
use std::fs;
use std::sync::Arc;

fn build_loop(
    workspace: &TestWorkspace,
    client: Arc<ScriptedModelClient>,
    cfg: AgentConfig,
) -> AgentLoop {
    let observer = Arc::new(Observer::new(&workspace.root).expect("observer"));
    let dispatcher = ToolDispatcher::new(&workspace.root, ToolsConfig::default(), observer.clone())
        .expect("dispatcher");
    AgentLoop::new(client, dispatcher, observer, cfg)
}

#[test]
fn immediate_text_answer_ends_after_one_round() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![text_turn("2 + 2 = 4")]));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    let outcome = agent.run("what is 2 + 2?").expect("run");
    assert_eq!(outcome.text, "2 + 2 = 4");
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.faults, 0);
    assert_eq!(outcome.usage.prompt_tokens, FAKE_PROMPT_TOKENS);
    assert_eq!(outcome.usage.response_tokens, FAKE_RESPONSE_TOKENS);

    assert_eq!(client.calls(), 1);
    let first = client.history_at(0);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].role, Role::User);
}

#[test]
fn exploration_run_feeds_tool_results_back_to_the_model() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(exploration_script(
        "main.py formats the result as JSON and prints it.",
    )));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    let outcome = agent.run("how does the calculator render results?").expect("run");
    assert_eq!(outcome.rounds, 3);
    assert_eq!(
        outcome.usage.prompt_tokens,
        FAKE_PROMPT_TOKENS * 3
    );
    assert_eq!(client.calls(), 3);

    // second call sees user, model (list_directory call), tool (listing)
    let second = client.history_at(1);
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Model);
    assert_eq!(second[2].role, Role::Tool);
    let Part::FunctionResponse { name, response } = &second[2].parts[0] else {
        panic!("expected function response part");
    };
    assert_eq!(name, "list_directory");
    let listing = response["result"].as_str().expect("listing");
    assert!(listing.starts_with("Result for current directory:"));
    assert!(listing.contains("main.py"));

    // third call sees the read_file result appended after everything else
    let third = client.history_at(2);
    assert_eq!(third.len(), 5);
    let Part::FunctionResponse { name, response } = &third[4].parts[0] else {
        panic!("expected function response part");
    };
    assert_eq!(name, "read_file");
    assert!(
        response["result"]
            .as_str()
            .expect("content")
            .contains("format_json_output")
    );
}

#[test]
fn each_model_call_sees_a_superset_of_the_previous_history() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(exploration_script("done")));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());
    agent.run("explore").expect("run");

    for index in 1..client.calls() {
        let earlier = client.history_at(index - 1);
        let later = client.history_at(index);
        assert!(later.len() > earlier.len());
        let earlier_json = serde_json::to_value(&earlier).expect("earlier");
        let later_json = serde_json::to_value(&later).expect("later");
        for (i, msg) in earlier_json.as_array().expect("array").iter().enumerate() {
            assert_eq!(msg, &later_json[i], "history rewrote message {i}");
        }
    }
}

#[test]
fn containment_violation_flows_back_as_an_error_result() {
    let workspace = TestWorkspace::new().expect("workspace");
    let secret = workspace.root.join("../secret.txt");
    fs::write(&secret, "credentials").expect("secret");

    let client = Arc::new(ScriptedModelClient::new(vec![
        call_turn("read_file", json!({"path": "../secret.txt"})),
        text_turn("That file is outside the working directory."),
    ]));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    let outcome = agent.run("read ../secret.txt").expect("run");
    assert_eq!(outcome.rounds, 2);

    let second = client.history_at(1);
    let Part::FunctionResponse { response, .. } = &second[2].parts[0] else {
        panic!("expected function response part");
    };
    assert_eq!(
        response["error"],
        "Cannot read \"../secret.txt\" as it is outside the permitted working directory"
    );
}

#[test]
fn round_budget_exhaustion_aborts_the_run() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![
        call_turn("list_directory", json!({"path": "."})),
        call_turn("list_directory", json!({"path": "."})),
        call_turn("list_directory", json!({"path": "."})),
    ]));
    let cfg = AgentConfig {
        max_rounds: 2,
        ..AgentConfig::default()
    };
    let agent = build_loop(&workspace, client.clone(), cfg);

    let err = agent.run("keep listing").expect_err("budget");
    match err.downcast_ref::<LoopError>() {
        Some(LoopError::IterationBudgetExceeded { rounds }) => assert_eq!(*rounds, 2),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.calls(), 2);
}

#[test]
fn malformed_response_consumes_a_round_and_is_retried() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![
        malformed_turn("missing usage metadata"),
        text_turn("recovered"),
    ]));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    let outcome = agent.run("hello").expect("run");
    assert_eq!(outcome.text, "recovered");
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.faults, 1);
    // only the well-formed round contributes usage
    assert_eq!(outcome.usage.prompt_tokens, FAKE_PROMPT_TOKENS);

    // the malformed turn never entered the history
    let second = client.history_at(1);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].role, Role::User);
}

#[test]
fn transport_fault_consumes_a_round_and_is_retried() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![]));
    client.push_fault("connection reset by peer");
    client.push_turn(text_turn("back online"));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    let outcome = agent.run("hello").expect("run");
    assert_eq!(outcome.text, "back online");
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.faults, 1);
}

#[test]
fn repeated_faults_exhaust_the_budget() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![
        malformed_turn("bad"),
        malformed_turn("still bad"),
    ]));
    let cfg = AgentConfig {
        max_rounds: 2,
        ..AgentConfig::default()
    };
    let agent = build_loop(&workspace, client, cfg);

    let err = agent.run("hello").expect_err("budget");
    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::IterationBudgetExceeded { rounds: 2 })
    ));
}

#[test]
fn write_then_execute_uses_the_sandbox_root_as_cwd() {
    let workspace = TestWorkspace::new().expect("workspace");
    let client = Arc::new(ScriptedModelClient::new(vec![
        call_turn(
            "write_file",
            json!({"path": "hello.py", "content": "print('made it')"}),
        ),
        text_turn("Wrote hello.py."),
    ]));
    let agent = build_loop(&workspace, client.clone(), AgentConfig::default());

    agent.run("create hello.py").expect("run");
    let written = fs::read_to_string(workspace.root.join("hello.py")).expect("written");
    assert_eq!(written, "print('made it')");

    let second = client.history_at(1);
    let Part::FunctionResponse { response, .. } = &second[2].parts[0] else {
        panic!("expected function response part");
    };
    assert!(
        response["result"]
            .as_str()
            .expect("result")
            .contains("Successfully wrote to \"hello.py\"")
    );
}
