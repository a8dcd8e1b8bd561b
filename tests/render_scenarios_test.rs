use serde_json::json;
use std::sync::Arc;
use stencil::{Caching, Context, Encoding, Error, MemorySource, StencilEngine};

fn engine_with(templates: &[(&str, &str)]) -> (StencilEngine, MemorySource) {
    let source = MemorySource::new();
    for (name, body) in templates {
        source.insert(*name, *body);
    }
    let engine = StencilEngine::new();
    engine
        .register_source("memory", Arc::new(source.clone()))
        .expect("source registration failed");
    (engine, source)
}

async fn render(
    engine: &StencilEngine,
    name: &str,
    data: serde_json::Value,
) -> stencil::Result<String> {
    let context = Context::from_json(data)?;
    let bytes = engine.render(name, &context).await?;
    Ok(String::from_utf8(bytes).expect("output was not UTF-8"))
}

#[tokio::test]
async fn test_nested_echo() {
    let (engine, _) = engine_with(&[("todo", "Todo: #(todo.title)")]);
    let out = render(&engine, "todo", json!({"todo": {"title": "Template!"}}))
        .await
        .unwrap();
    assert_eq!(out, "Todo: Template!");
}

#[tokio::test]
async fn test_import_resolution_with_default() {
    let (engine, _) = engine_with(&[
        (
            "base",
            "#define(adminValue = admin)\n#inline(\"parameter\")",
        ),
        (
            "parameter",
            "#if(evaluate(adminValue ?? false)):Hi Admin#else:No Access#endif",
        ),
    ]);

    let granted = render(&engine, "base", json!({"admin": true})).await.unwrap();
    assert_eq!(granted, "Hi Admin");

    let denied = render(&engine, "base", json!({"admin": false}))
        .await
        .unwrap();
    assert_eq!(denied, "No Access");
}

#[tokio::test]
async fn test_deep_resolve_in_loop() {
    let (engine, _) = engine_with(&[
        (
            "a",
            "#for(a in b):#define(derp):DEEP #(a)#enddefine\n#inline(\"b\")\n#endfor",
        ),
        ("b", "#evaluate(derp)\n"),
    ]);

    let out = render(&engine, "a", json!({"b": ["1", "2", "3"]}))
        .await
        .unwrap();
    assert_eq!(out, "DEEP 1\nDEEP 2\nDEEP 3\n");
}

#[tokio::test]
async fn test_cyclical_inline_chain() {
    let (engine, _) = engine_with(&[
        ("a", "#inline(\"b\")"),
        ("b", "#inline(\"c\")"),
        ("c", "#inline(\"a\")"),
    ]);

    let error = render(&engine, "a", json!({})).await.unwrap_err();
    let Error::CyclicalReference { name, chain } = error else {
        panic!("expected a cyclical reference error");
    };
    assert_eq!(name, "a");
    assert_eq!(chain.first().map(String::as_str), Some("a"));
    assert_eq!(chain.last().map(String::as_str), Some("a"));
}

#[tokio::test]
async fn test_encoding_utf8_and_failure() {
    let (engine, _) = engine_with(&[("tau", "τ")]);

    // UTF-8 yields the two-byte sequence for the code point
    let context = Context::from_json(json!({})).unwrap();
    let bytes = engine.render("tau", &context).await.unwrap();
    assert_eq!(bytes, vec![0xCF, 0x84]);

    // a codec that cannot express the code point fails the render
    let mut ascii_context = Context::from_json(json!({})).unwrap();
    ascii_context.options.encoding = Encoding::Ascii;
    let error = engine.render("tau", &ascii_context).await.unwrap_err();
    assert!(matches!(error, Error::Encoding(_)));
}

#[tokio::test]
async fn test_auto_update_serves_fresh_source() {
    let (engine, source) = engine_with(&[("page", "first")]);

    let mut context = Context::from_json(json!({})).unwrap();
    context.options.caching = Caching::default_behavior().with(Caching::AUTO_UPDATE);
    context.options = context.options.polling_frequency(0.01);

    let bytes = engine.render("page", &context).await.unwrap();
    assert_eq!(bytes, b"first");

    source.insert("page", "second");
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let bytes = engine.render("page", &context).await.unwrap();
    assert_eq!(bytes, b"second");
}

#[tokio::test]
async fn test_without_auto_update_original_is_served() {
    let (engine, source) = engine_with(&[("page", "first")]);

    let context = Context::from_json(json!({})).unwrap();
    assert_eq!(engine.render("page", &context).await.unwrap(), b"first");

    source.insert("page", "second");
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // default caching keeps the compiled AST
    assert_eq!(engine.render("page", &context).await.unwrap(), b"first");
}

#[tokio::test]
async fn test_raw_inline_embeds_bytes() {
    let (engine, _) = engine_with(&[
        ("page", "<style>#inline(\"style.css\", as: raw)</style>"),
        ("style.css", "body { margin: 0; }"),
    ]);
    let out = render(&engine, "page", json!({})).await.unwrap();
    assert_eq!(out, "<style>body { margin: 0; }</style>");
}

#[tokio::test]
async fn test_chained_blocks_through_engine() {
    let (engine, _) = engine_with(&[(
        "gate",
        "#if(count >= 10):big#elseif(count >= 5):medium#else:small#endif",
    )]);
    assert_eq!(
        render(&engine, "gate", json!({"count": 12})).await.unwrap(),
        "big"
    );
    assert_eq!(
        render(&engine, "gate", json!({"count": 7})).await.unwrap(),
        "medium"
    );
    assert_eq!(
        render(&engine, "gate", json!({"count": 1})).await.unwrap(),
        "small"
    );
}

#[tokio::test]
async fn test_missing_template_error() {
    let (engine, _) = engine_with(&[]);
    let error = render(&engine, "absent", json!({})).await.unwrap_err();
    assert!(matches!(error, Error::NoTemplateExists(name) if name == "absent"));
}
