mod common;

use async_trait::async_trait;
use common::{CallLog, MockExecutor, ReplaySubscriber, error_at, request};
use futures::StreamExt;
use portkey_stitch::{
    DelegationError, DelegationRequest, ExecutionError, ExecutionResult, Executor,
    FederationGateway, GraphQLError, GraphQLRequest, GraphQLResponse, InMemorySchemaRegistry,
    MergedTypeConfig, OperationKind, SchemaGraph, SchemaRegistry, StitchedSchema, SubRequest,
    Subschema,
};
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use std::{fs, sync::Arc};

const BOOKS_SDL: &str = r#"
type Query { book(id: ID!): Book }
type Book { id: ID! title: String }
"#;

const ISBN_SDL: &str = r#"
type Query { bookById(id: ID!): Book }
type Book { id: ID! isbn: String }
"#;

fn variables(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn books_executor(log: &CallLog) -> Arc<MockExecutor> {
    MockExecutor::fixed(
        "books",
        log,
        json!({ "book": { "__typename": "Book", "id": "1", "title": "Dune" } }),
    )
}

fn isbn_executor(log: &CallLog) -> Arc<MockExecutor> {
    MockExecutor::new("isbn", log, |request| {
        let id = request
            .variables
            .values()
            .next()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ExecutionResult::from_data(json!({
            "bookById": { "__typename": "Book", "id": id, "isbn": format!("isbn-{}", id) }
        })))
    })
}

fn book_subschemas(log: &CallLog) -> Vec<Subschema> {
    books_with_isbn(log, isbn_executor(log))
}

fn books_with_isbn(log: &CallLog, isbn: Arc<MockExecutor>) -> Vec<Subschema> {
    vec![
        Subschema::new("books", BOOKS_SDL, books_executor(log))
            .unwrap()
            .with_merged_type(
                "Book",
                MergedTypeConfig::by_key("book", "id").selection_set("{ id }"),
            ),
        Subschema::new("isbn", ISBN_SDL, isbn)
            .unwrap()
            .with_merged_type(
                "Book",
                MergedTypeConfig::by_key("bookById", "id").selection_set("{ id }"),
            ),
    ]
}

async fn gateway_with(subschemas: Vec<Subschema>) -> FederationGateway {
    let gateway = FederationGateway::new(Box::new(InMemorySchemaRegistry::new()));
    for subschema in subschemas {
        gateway.register_subschema(subschema).await.unwrap();
    }
    gateway
}

/// Serves one prebuilt schema, for gateways whose schema is not the plain
/// union of their subschemas.
struct FixedRegistry(Arc<StitchedSchema>);

#[async_trait]
impl SchemaRegistry for FixedRegistry {
    async fn register_subschema(&mut self, subschema: Subschema) -> Result<(), DelegationError> {
        Err(DelegationError::Config(format!(
            "cannot register {} on a fixed schema",
            subschema.name
        )))
    }

    async fn get_schema(&self) -> Result<Arc<StitchedSchema>, DelegationError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_merges_book_fields_from_two_subschemas() {
    let log = CallLog::default();
    let gateway = gateway_with(book_subschemas(&log)).await;

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { id title isbn } }"#))
        .await
        .unwrap();

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "book": { "id": "1", "title": "Dune", "isbn": "isbn-1" } })),
            errors: vec![],
        }
    );
    assert_eq!(log.subschemas(), vec!["books", "isbn"]);

    let calls = log.calls();
    assert!(!calls[0].query.contains("isbn"));
    assert!(calls[0].query.contains("__typename"));
    assert_eq!(calls[1].root_field, "bookById");
    assert_eq!(calls[1].variables, variables(json!({ "_v0_id": "1" })));
}

#[tokio::test]
async fn test_forwards_fragments_and_variables() {
    let log = CallLog::default();
    let gateway = gateway_with(book_subschemas(&log)).await;

    let response = gateway
        .process_request(GraphQLRequest {
            query: r#"
                query Book($id: ID!) { book(id: $id) { ...BookFields } }
                fragment BookFields on Book { title isbn }
            "#
            .to_string(),
            variables: Some(json!({ "id": 1 })),
            operation_name: Some("Book".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "book": { "title": "Dune", "isbn": "isbn-1" } }))
    );
    let calls = log.calls();
    assert_eq!(calls[0].variables, variables(json!({ "_v0_id": "1" })));
    assert!(calls[0].query.contains("fragment BookFields on Book"));
    assert!(!calls[0].query.contains("$id"));
}

#[tokio::test]
async fn test_reports_fields_no_subschema_provides() {
    let log = CallLog::default();
    let gateway_schema = SchemaGraph::parse(
        r#"
        type Query { book(id: ID!): Book bookById(id: ID!): Book }
        type Book { id: ID! title: String isbn: String publisher: String }
        "#,
    )
    .unwrap();
    let stitched =
        StitchedSchema::with_gateway_schema(book_subschemas(&log), gateway_schema).unwrap();
    let gateway = FederationGateway::new(Box::new(FixedRegistry(Arc::new(stitched))));

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { id title isbn publisher } }"#))
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "book": { "id": "1", "title": "Dune", "isbn": "isbn-1", "publisher": null } }))
    );
    assert_eq!(response.errors.len(), 1);
    assert_eq!(
        serde_json::to_value(&response.errors[0].path).unwrap(),
        json!(["book", "publisher"])
    );
    assert!(response.errors[0].message.contains("publisher"));
    assert!(!log.calls()[0].query.contains("publisher"));
}

#[tokio::test]
async fn test_backfills_the_target_default_argument() {
    let log = CallLog::default();
    let gateway = gateway_with(vec![
        Subschema::new(
            "a",
            "type Query { f(x: Int = 3): Int }",
            MockExecutor::fixed("a", &log, json!({ "f": 3 })),
        )
        .unwrap(),
        Subschema::new(
            "b",
            "type Query { f(x: Int = 5): Int }",
            MockExecutor::fixed("b", &log, json!({ "f": 5 })),
        )
        .unwrap(),
    ])
    .await;

    let response = gateway
        .delegate_to_schema(DelegationRequest {
            subschema: "b".to_string(),
            operation: OperationKind::Query,
            field_name: "f".to_string(),
            args: Map::new(),
            selection_set: None,
            context: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(response.data, Some(json!({ "f": 5 })));

    gateway.process_request(request("{ f }")).await.unwrap();

    let calls = log.calls();
    assert_eq!(log.subschemas(), vec!["b", "a"]);
    assert_eq!(calls[0].variables, variables(json!({ "_v0_x": 5 })));
    assert_eq!(calls[1].variables, variables(json!({ "_v0_x": 3 })));
}

#[tokio::test]
async fn test_keeps_list_length_when_an_element_fails() {
    let log = CallLog::default();
    let executor = MockExecutor::new("library", &log, |_| {
        Ok(ExecutionResult {
            data: Some(json!({ "books": [
                { "title": "v0" },
                { "title": "v1" },
                null,
                { "title": "v3" },
                { "title": "v4" },
            ] })),
            errors: vec![error_at("element 2 failed", json!(["books", 2]))],
        })
    });
    let gateway = gateway_with(vec![
        Subschema::new(
            "library",
            "type Query { books: [Book] } type Book { title: String }",
            executor,
        )
        .unwrap(),
    ])
    .await;

    let response = gateway.process_request(request("{ books { title } }")).await.unwrap();

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "books": [
                { "title": "v0" },
                { "title": "v1" },
                null,
                { "title": "v3" },
                { "title": "v4" },
            ] })),
            errors: vec![error_at("element 2 failed", json!(["books", 2]))],
        }
    );
}

#[tokio::test]
async fn test_combines_errors_on_the_same_null_object() {
    let log = CallLog::default();
    let executor = MockExecutor::new("books", &log, |_| {
        Ok(ExecutionResult {
            data: Some(json!({ "book": null })),
            errors: vec![
                error_at("author lookup failed", json!(["book"])),
                error_at("price lookup failed", json!(["book"])),
            ],
        })
    });
    let gateway = gateway_with(vec![Subschema::new("books", BOOKS_SDL, executor).unwrap()]).await;

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { title } }"#))
        .await
        .unwrap();

    assert_eq!(response.data, Some(json!({ "book": null })));
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].message, "author lookup failed\nprice lookup failed");
    assert_eq!(response.errors[0].original_errors.len(), 2);
    assert_eq!(
        serde_json::to_value(&response.errors[0]).unwrap(),
        json!({ "message": "author lookup failed\nprice lookup failed", "path": ["book"] })
    );
}

#[tokio::test]
async fn test_executor_failures_become_field_errors() {
    let log = CallLog::default();
    let executor =
        MockExecutor::new("books", &log, |_| Err(ExecutionError::new("connection refused")));
    let gateway = gateway_with(vec![Subschema::new("books", BOOKS_SDL, executor).unwrap()]).await;

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { title } }"#))
        .await
        .unwrap();

    assert_eq!(response.data, Some(json!({ "book": null })));
    assert_eq!(response.errors, vec![error_at("connection refused", json!(["book"]))]);
}

#[tokio::test]
async fn test_resolves_fields_across_multiple_hops() {
    let log = CallLog::default();
    let catalog = MockExecutor::fixed(
        "catalog",
        &log,
        json!({ "product": { "__typename": "Product", "id": "1", "name": "Lamp" } }),
    );
    let inventory = MockExecutor::fixed(
        "inventory",
        &log,
        json!({ "stock": { "__typename": "Product", "id": "1", "sku": "S1" } }),
    );
    let pricing = MockExecutor::new("pricing", &log, |request| {
        let price = match request.variables.get("_v0_sku").and_then(Value::as_str) {
            Some("S1") => json!(9.5),
            _ => Value::Null,
        };
        Ok(ExecutionResult::from_data(json!({
            "price": { "__typename": "Product", "price": price }
        })))
    });

    let gateway = gateway_with(vec![
        Subschema::new(
            "catalog",
            "type Query { product(id: ID!): Product } type Product { id: ID! name: String }",
            catalog,
        )
        .unwrap()
        .with_merged_type(
            "Product",
            MergedTypeConfig::by_key("product", "id").selection_set("{ id }"),
        ),
        Subschema::new(
            "inventory",
            "type Query { stock(id: ID!): Product } type Product { id: ID! sku: String }",
            inventory,
        )
        .unwrap()
        .with_merged_type(
            "Product",
            MergedTypeConfig::by_key("stock", "id").selection_set("{ id }"),
        ),
        Subschema::new(
            "pricing",
            "type Query { price(sku: String!): Product } type Product { sku: String price: Float }",
            pricing,
        )
        .unwrap()
        .with_merged_type(
            "Product",
            MergedTypeConfig::by_key("price", "sku").field_selection_set("price", "{ sku }"),
        ),
    ])
    .await;

    let response = gateway
        .process_request(request(r#"{ product(id: "1") { name price } }"#))
        .await
        .unwrap();

    assert_eq!(response.data, Some(json!({ "product": { "name": "Lamp", "price": 9.5 } })));
    assert!(response.errors.is_empty());
    assert_eq!(log.subschemas(), vec!["catalog", "inventory", "pricing"]);
    assert_eq!(log.calls()[2].variables, variables(json!({ "_v0_sku": "S1" })));
}

#[tokio::test]
async fn test_runs_mutation_fields_in_order() {
    let log = CallLog::default();
    let executor = MockExecutor::new("ratings", &log, |request| {
        let id = request.variables.get("_v0_id").cloned().unwrap_or(Value::Null);
        Ok(ExecutionResult::from_data(json!({ "rate": { "id": id } })))
    });
    let gateway = gateway_with(vec![
        Subschema::new(
            "ratings",
            r#"
            type Query { a: Int }
            type Mutation { rate(id: ID!, stars: Int!): Rating }
            type Rating { id: ID! }
            "#,
            executor,
        )
        .unwrap(),
    ])
    .await;

    let response = gateway
        .process_request(request(
            "mutation { first: rate(id: 1, stars: 5) { id } second: rate(id: 2, stars: 4) { id } }",
        ))
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "first": { "id": "1" }, "second": { "id": "2" } }))
    );
    let calls = log.calls();
    assert!(calls.iter().all(|call| call.query.starts_with("mutation")));
    assert_eq!(calls[0].variables, variables(json!({ "_v0_id": "1", "_v1_stars": 5 })));
    assert_eq!(calls[1].variables, variables(json!({ "_v0_id": "2", "_v1_stars": 4 })));
}

#[tokio::test]
async fn test_maps_every_subscription_event() {
    let log = CallLog::default();
    let subscriber = Arc::new(ReplaySubscriber {
        name: "events".to_string(),
        log: log.clone(),
        events: vec![
            ExecutionResult::from_data(json!({ "bookAdded": { "id": "1", "title": "Dune" } })),
            ExecutionResult {
                data: Some(json!({ "bookAdded": null })),
                errors: vec![error_at("feed interrupted", json!(["bookAdded"]))],
            },
        ],
    });
    let gateway = gateway_with(vec![
        Subschema::new(
            "events",
            r#"
            type Query { a: Int }
            type Subscription { bookAdded: Book }
            type Book { id: ID! title: String }
            "#,
            MockExecutor::fixed("events", &log, Value::Null),
        )
        .unwrap()
        .with_subscriber(subscriber),
    ])
    .await;

    let stream = gateway
        .subscribe(request("subscription { added: bookAdded { title } }"))
        .await
        .unwrap();
    let responses: Vec<GraphQLResponse> = stream.collect().await;

    assert_eq!(
        responses,
        vec![
            GraphQLResponse {
                data: Some(json!({ "added": { "title": "Dune" } })),
                errors: vec![],
            },
            GraphQLResponse {
                data: Some(json!({ "added": null })),
                errors: vec![error_at("feed interrupted", json!(["added"]))],
            },
        ]
    );
    assert!(log.calls()[0].query.starts_with("subscription"));
}

#[tokio::test]
async fn test_loads_subgraphs_from_a_config_file() {
    let dir = std::env::temp_dir().join(format!("portkey-stitch-config-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("books.graphql"), BOOKS_SDL).unwrap();
    fs::write(
        dir.join("stitching.yaml"),
        format!(
            r#"
subgraphs:
  books:
    schema:
      file: books.graphql
    merge:
      Book:
        selection_set: "{{ id }}"
        field_name: book
        key_field: id
  isbn:
    schema:
      sdl: {:?}
    merge:
      Book:
        selection_set: "{{ id }}"
        field_name: bookById
        key_field: id
"#,
            ISBN_SDL
        ),
    )
    .unwrap();

    let log = CallLog::default();
    let books: Arc<dyn Executor> = books_executor(&log);
    let isbn: Arc<dyn Executor> = isbn_executor(&log);
    let gateway = FederationGateway::new(Box::new(InMemorySchemaRegistry::new()));
    gateway
        .load_config(dir.join("stitching.yaml"), |name| match name {
            "books" => Some(books.clone()),
            "isbn" => Some(isbn.clone()),
            _ => None,
        })
        .await
        .unwrap();

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { title isbn } }"#))
        .await
        .unwrap();
    assert_eq!(
        response.data,
        Some(json!({ "book": { "title": "Dune", "isbn": "isbn-1" } }))
    );

    fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_requests_key_fields_declared_only_by_key() {
    let log = CallLog::default();
    let gateway = gateway_with(vec![
        Subschema::new("books", BOOKS_SDL, books_executor(&log))
            .unwrap()
            .with_merged_type("Book", MergedTypeConfig::by_key("book", "id")),
        Subschema::new("isbn", ISBN_SDL, isbn_executor(&log))
            .unwrap()
            .with_merged_type("Book", MergedTypeConfig::by_key("bookById", "id")),
    ])
    .await;

    let response = gateway
        .process_request(request(r#"{ book(id: "1") { title isbn } }"#))
        .await
        .unwrap();

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "book": { "title": "Dune", "isbn": "isbn-1" } })),
            errors: vec![],
        }
    );
    let calls = log.calls();
    assert!(calls[0].query.lines().any(|line| line.trim() == "id"));
    assert_eq!(calls[1].variables, variables(json!({ "_v0_id": "1" })));
}

async fn book_with_isbn_failure<F>(respond: F) -> GraphQLResponse
where
    F: Fn(&SubRequest) -> Result<ExecutionResult, ExecutionError> + Send + Sync + 'static,
{
    let log = CallLog::default();
    let isbn = MockExecutor::new("isbn", &log, respond);
    let gateway = gateway_with(books_with_isbn(&log, isbn)).await;
    let response = gateway
        .process_request(request(r#"{ book(id: "1") { title isbn } }"#))
        .await
        .unwrap();
    assert_eq!(log.subschemas(), vec!["books", "isbn"]);
    response
}

#[tokio::test]
async fn test_rebases_merge_errors_onto_the_client_path() {
    let response = book_with_isbn_failure(|_| {
        Ok(ExecutionResult {
            data: Some(json!({
                "bookById": { "__typename": "Book", "id": "1", "isbn": null }
            })),
            errors: vec![error_at("isbn service degraded", json!(["bookById", "isbn"]))],
        })
    })
    .await;

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "book": { "title": "Dune", "isbn": null } })),
            errors: vec![error_at("isbn service degraded", json!(["book", "isbn"]))],
        }
    );
}

#[tokio::test]
async fn test_places_pathless_merge_errors_on_the_first_assigned_field() {
    let response = book_with_isbn_failure(|_| {
        Ok(ExecutionResult {
            data: Some(json!({ "bookById": null })),
            errors: vec![GraphQLError::new("partial outage")],
        })
    })
    .await;

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "book": { "title": "Dune", "isbn": null } })),
            errors: vec![error_at("partial outage", json!(["book", "isbn"]))],
        }
    );
}

#[tokio::test]
async fn test_merge_executor_failures_become_field_errors() {
    let response =
        book_with_isbn_failure(|_| Err(ExecutionError::new("connection refused"))).await;

    assert_eq!(
        response,
        GraphQLResponse {
            data: Some(json!({ "book": { "title": "Dune", "isbn": null } })),
            errors: vec![error_at("connection refused", json!(["book", "isbn"]))],
        }
    );
}
