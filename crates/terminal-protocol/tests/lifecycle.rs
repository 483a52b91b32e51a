mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use futures_util::StreamExt;
use serde_json::json;
use terminal_protocol::error::codes;
use terminal_protocol::{
    respond_with, ProtocolError, ResponsePayload, ServiceHandler, ServiceOptions, ServiceOutput,
    Terminal, TerminalConfig,
};

use common::{attach_terminal, start_host, wait_until, BudgetDialer};

#[tokio::test]
async fn request_round_trip_through_host() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-echo").await;
    let client = attach_terminal(&hub, "term-caller").await;

    server
        .provide(
            "echo",
            "Echo",
            json!({}),
            ServiceOptions::default(),
            respond_with(|msg| async move {
                Ok(ResponsePayload::ok_with_data(
                    "OK",
                    msg.req.unwrap_or_default(),
                ))
            }),
        )
        .unwrap();

    wait_until("echo service visible", || {
        !client.resolve_targets("Echo", &json!({"n": 1})).is_empty()
    })
    .await;

    let res = client
        .request_for_response("Echo", json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(res.code, codes::OK);
    assert_eq!(res.data, Some(json!({"n": 1})));
}

#[tokio::test]
async fn unknown_method_is_refused_with_400() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;
    let _ = server;

    let stream = client
        .request_to("term-a", "NoSuchMethod", json!({}))
        .unwrap();
    let res = stream.response().await.unwrap();
    assert_eq!(res.code, codes::BAD_REQUEST);
    assert_eq!(res.message, "Bad Request: Method Not Found");
}

#[tokio::test]
async fn schema_mismatch_is_refused_with_400() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    server
        .provide(
            "query-btc",
            "Query",
            json!({"properties": {"symbol": {"const": "BTC"}}, "required": ["symbol"]}),
            ServiceOptions::default(),
            respond_with(|_| async { Ok(ResponsePayload::ok("OK")) }),
        )
        .unwrap();

    let stream = client
        .request_to("term-a", "Query", json!({"symbol": "ETH"}))
        .unwrap();
    let res = stream.response().await.unwrap();
    assert_eq!(res.code, codes::BAD_REQUEST);
    assert_eq!(res.message, "Bad Request: No Matching Service");
}

#[tokio::test]
async fn two_matching_services_are_ambiguous() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let ok: ServiceHandler = respond_with(|_| async { Ok(ResponsePayload::ok("OK")) });
    server
        .provide("q1", "Query", json!({}), ServiceOptions::default(), ok.clone())
        .unwrap();
    server
        .provide("q2", "Query", json!({}), ServiceOptions::default(), ok)
        .unwrap();

    let stream = client.request_to("term-a", "Query", json!({})).unwrap();
    let res = stream.response().await.unwrap();
    assert_eq!(res.code, codes::BAD_REQUEST);
    assert_eq!(res.message, "Bad Request: Ambiguous Service");
}

#[tokio::test]
async fn schema_routing_picks_the_matching_terminal() {
    let (hub, _host) = start_host().await;
    let btc = attach_terminal(&hub, "term-btc").await;
    let eth = attach_terminal(&hub, "term-eth").await;
    let client = attach_terminal(&hub, "term-caller").await;

    for (terminal, symbol) in [(&btc, "BTC"), (&eth, "ETH")] {
        let tag = symbol.to_string();
        terminal
            .provide(
                "ticker",
                "QueryTicker",
                json!({"properties": {"symbol": {"const": symbol}}}),
                ServiceOptions::default(),
                respond_with(move |_| {
                    let tag = tag.clone();
                    async move { Ok(ResponsePayload::ok_with_data("OK", json!({"served_by": tag}))) }
                }),
            )
            .unwrap();
    }

    wait_until("both tickers visible", || {
        client
            .resolve_targets("QueryTicker", &json!({"symbol": "BTC"}))
            .len()
            == 1
            && client
                .resolve_targets("QueryTicker", &json!({"symbol": "ETH"}))
                .len()
                == 1
    })
    .await;

    let res = client
        .request_for_response("QueryTicker", json!({"symbol": "ETH"}))
        .await
        .unwrap();
    assert_eq!(res.data, Some(json!({"served_by": "ETH"})));
}

#[tokio::test]
async fn stream_frames_arrive_before_the_response() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let handler: ServiceHandler = Arc::new(|_msg, _abort| {
        stream::iter(vec![
            Ok(ServiceOutput::Frame(json!({"tick": 1}))),
            Ok(ServiceOutput::Frame(json!({"tick": 2}))),
            Ok(ServiceOutput::Response(ResponsePayload::ok("done"))),
        ])
        .boxed()
    });
    server
        .provide("ticks", "StreamTicks", json!({}), ServiceOptions::default(), handler)
        .unwrap();

    let mut stream = client.request_to("term-a", "StreamTicks", json!({})).unwrap();
    let mut frames = Vec::new();
    let mut response = None;
    while let Some(item) = stream.next().await {
        let msg = item.unwrap();
        if let Some(frame) = msg.frame {
            frames.push(frame);
        }
        if let Some(res) = msg.res {
            response = Some(res);
        }
    }
    assert_eq!(frames, vec![json!({"tick": 1}), json!({"tick": 2})]);
    assert_eq!(response.unwrap().message, "done");
}

#[tokio::test]
async fn handler_stream_end_without_response_yields_ok() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let handler: ServiceHandler = Arc::new(|_msg, _abort| {
        stream::iter(vec![Ok(ServiceOutput::Frame(json!({"only": "frames"})))]).boxed()
    });
    server
        .provide("frames", "FramesOnly", json!({}), ServiceOptions::default(), handler)
        .unwrap();

    let res = client
        .request_to("term-a", "FramesOnly", json!({}))
        .unwrap()
        .response()
        .await
        .unwrap();
    assert_eq!(res.code, codes::OK);
    assert_eq!(res.message, "OK");
}

#[tokio::test]
async fn items_after_the_response_are_discarded() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let handler: ServiceHandler = Arc::new(|_msg, _abort| {
        stream::iter(vec![
            Ok(ServiceOutput::Response(ResponsePayload::ok("first"))),
            Ok(ServiceOutput::Response(ResponsePayload::ok("second"))),
            Ok(ServiceOutput::Frame(json!({"late": true}))),
        ])
        .boxed()
    });
    server
        .provide("chatty", "Chatty", json!({}), ServiceOptions::default(), handler)
        .unwrap();

    let mut stream = client.request_to("term-a", "Chatty", json!({})).unwrap();
    let mut terminals = 0;
    let mut frames = 0;
    while let Some(item) = stream.next().await {
        let msg = item.unwrap();
        if msg.res.is_some() {
            terminals += 1;
        }
        if msg.frame.is_some() {
            frames += 1;
        }
    }
    assert_eq!(terminals, 1);
    assert_eq!(frames, 0);
    // give any stragglers time to arrive; none should
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn handler_error_becomes_500() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    server
        .provide(
            "broken",
            "Broken",
            json!({}),
            ServiceOptions::default(),
            respond_with(|_| async { Err(anyhow::anyhow!("backend offline")) }),
        )
        .unwrap();

    let res = client
        .request_to("term-a", "Broken", json!({}))
        .unwrap()
        .response()
        .await
        .unwrap();
    assert_eq!(res.code, codes::INTERNAL_ERROR);
    assert_eq!(res.message, "backend offline");
}

#[tokio::test]
async fn handler_deadline_becomes_504() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let options = ServiceOptions {
        timeout: Some(Duration::from_millis(200)),
        ..ServiceOptions::default()
    };
    server
        .provide(
            "slow",
            "Slow",
            json!({}),
            options,
            respond_with(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ResponsePayload::ok("too late"))
            }),
        )
        .unwrap();

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        client.request_to("term-a", "Slow", json!({})).unwrap().response(),
    )
    .await
    .expect("terminal event within deadline")
    .unwrap();
    assert_eq!(res.code, codes::GATEWAY_TIMEOUT);
    assert_eq!(res.message, "Gateway Timeout");
}

#[tokio::test]
async fn dropping_the_call_stream_frees_the_processing_slot() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let client = attach_terminal(&hub, "term-b").await;

    let options = ServiceOptions {
        concurrent: Some(1),
        ..ServiceOptions::default()
    };
    server
        .provide(
            "gated",
            "Gated",
            json!({}),
            options,
            respond_with(|msg| async move {
                let wait = msg
                    .req
                    .as_ref()
                    .and_then(|r| r.get("wait_ms"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                Ok(ResponsePayload::ok("OK"))
            }),
        )
        .unwrap();

    // first call hogs the only slot, then is abandoned
    let first = client
        .request_to("term-a", "Gated", json!({"wait_ms": 60_000}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(first);

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        client
            .request_to("term-a", "Gated", json!({"wait_ms": 0}))
            .unwrap()
            .response(),
    )
    .await
    .expect("slot released after abort")
    .unwrap();
    assert_eq!(res.code, codes::OK);
}

#[tokio::test]
async fn disposing_the_terminal_fails_open_calls_promptly() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;
    let caller = attach_terminal(&hub, "term-b").await;

    server
        .provide(
            "slow",
            "Slow",
            json!({}),
            ServiceOptions::default(),
            respond_with(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ResponsePayload::ok("OK"))
            }),
        )
        .unwrap();

    let mut call = caller.request_to("term-a", "Slow", json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    caller.dispose();
    let item = tokio::time::timeout(Duration::from_secs(3), call.next())
        .await
        .expect("call ends promptly")
        .expect("stream yields a final item");
    assert!(matches!(item, Err(ProtocolError::Disposed)));
}

#[tokio::test]
async fn losing_the_host_link_fails_open_calls_promptly() {
    let (hub, _host) = start_host().await;
    let server = attach_terminal(&hub, "term-a").await;

    server
        .provide(
            "slow",
            "Slow",
            json!({}),
            ServiceOptions::default(),
            respond_with(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ResponsePayload::ok("OK"))
            }),
        )
        .unwrap();

    // one successful dial only, so the drop below is final
    let config = {
        let mut c = TerminalConfig::new("memory://hub");
        c.terminal_id = "term-b".to_string();
        c
    };
    let caller = Terminal::with_dialer(
        config,
        Arc::new(BudgetDialer::new(hub.clone(), "term-b", 1)),
    )
    .await
    .unwrap();

    let mut call = caller.request_to("term-a", "Slow", json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    hub.kick("term-b");
    let item = tokio::time::timeout(Duration::from_secs(3), call.next())
        .await
        .expect("call ends promptly")
        .expect("stream yields a final item");
    assert!(matches!(item, Err(ProtocolError::ConnectionLost)));
}

#[tokio::test]
async fn builtin_ping_answers_pong() {
    let (hub, _host) = start_host().await;
    let a = attach_terminal(&hub, "term-a").await;
    let b = attach_terminal(&hub, "term-b").await;
    let _ = a;

    let res = b
        .request_to("term-a", "Ping", json!({}))
        .unwrap()
        .response()
        .await
        .unwrap();
    assert_eq!(res.code, codes::OK);
    assert_eq!(res.message, "Pong");
}

#[tokio::test]
async fn builtin_metrics_exposes_prometheus_text() {
    let (hub, _host) = start_host().await;
    let a = attach_terminal(&hub, "term-a").await;
    let b = attach_terminal(&hub, "term-b").await;
    let _ = a;

    let res = b
        .request_to("term-a", "Metrics", json!({}))
        .unwrap()
        .response()
        .await
        .unwrap();
    assert_eq!(res.code, codes::OK);
    let text = res
        .data
        .as_ref()
        .and_then(|d| d.get("metrics"))
        .and_then(|m| m.as_str())
        .unwrap()
        .to_string();
    assert!(text.contains("terminal_messages_sent_total"));
}
