mod common;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use common::*;
use hugin::config::StaticNameservers;
use hugin::error::ResolveError;
use hugin::record::{RecordData, RecordType};
use hugin::resolver::Family;

#[tokio::test]
async fn cache_hit_completes_without_wire_traffic() {
    let (resolver, net) = resolver_with(&[s1()]);
    resolver.cache().put(
        "example.com",
        RecordType::A,
        vec![a_record("example.com", 300, [93, 184, 216, 34])],
    );

    let addrs = resolver.resolve4("example.com").await.unwrap();
    assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    assert_eq!(net.total_sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn single_query_success_populates_cache() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![a_record(&q.name, 60, [93, 184, 216, 34])])),
    );

    let addrs = resolver.resolve4("example.com").await.unwrap();
    assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    assert_eq!(net.sent_count(s1()), 1);

    // Cached within the 60 s TTL: no second packet.
    tokio::time::advance(Duration::from_secs(59)).await;
    let addrs = resolver.resolve4("example.com").await.unwrap();
    assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    assert_eq!(net.sent_count(s1()), 1);

    // Expired: the next lookup goes back to the wire.
    tokio::time::advance(Duration::from_secs(2)).await;
    resolver.resolve4("example.com").await.unwrap();
    assert_eq!(net.sent_count(s1()), 2);
}

#[tokio::test(start_paused = true)]
async fn nxdomain_completes_empty_and_caches_negatively() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(s1(), Behavior::respond(|q| nxdomain(q)));

    let addrs = resolver.resolve4("nope.example").await.unwrap();
    assert!(addrs.is_empty());
    assert_eq!(net.sent_count(s1()), 1);

    // Within the negative-TTL window: answered from cache.
    let addrs = resolver.resolve4("nope.example").await.unwrap();
    assert!(addrs.is_empty());
    assert_eq!(net.sent_count(s1()), 1);

    // After the window the query is retried on the wire.
    tokio::time::advance(Duration::from_secs(16)).await;
    resolver.resolve4("nope.example").await.unwrap();
    assert_eq!(net.sent_count(s1()), 2);
}

#[tokio::test(start_paused = true)]
async fn multi_type_race_first_non_empty_wins() {
    let (resolver, net) = resolver_with(&[s1()]);
    // AAAA answers NoData immediately; A answers 10 ms later with a record.
    net.set_behavior(
        s1(),
        Behavior::with(|q| match q.rtype {
            RecordType::AAAA => MockReply::Respond {
                response: nodata(q),
                delay: Duration::ZERO,
            },
            RecordType::A => MockReply::Respond {
                response: answer(q, vec![a_record(&q.name, 60, [93, 184, 216, 34])]),
                delay: Duration::from_millis(10),
            },
            _ => MockReply::Ignore,
        }),
    );

    let records = resolver
        .lookup_family("example.com", Family::Any)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].data,
        RecordData::A(Ipv4Addr::new(93, 184, 216, 34))
    );
    // Both types were submitted.
    assert_eq!(net.sent_count(s1()), 2);
}

#[tokio::test]
async fn lookup_returns_first_address_record() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::with(|q| match q.rtype {
            RecordType::A => MockReply::Respond {
                response: answer(q, vec![a_record(&q.name, 60, [1, 2, 3, 4])]),
                delay: Duration::ZERO,
            },
            _ => MockReply::Ignore,
        }),
    );

    let record = resolver.lookup("example.com").await.unwrap();
    assert_eq!(record.data, RecordData::A(Ipv4Addr::new(1, 2, 3, 4)));
}

#[tokio::test(start_paused = true)]
async fn all_types_negative_completes_empty() {
    let (resolver, _net) = resolver_with(&[s1()]);
    net_all_nodata(&_net);

    let records = resolver
        .lookup_family("nodata.example", Family::Any)
        .await
        .unwrap();
    assert!(records.is_empty());

    // Both types were cached negatively: no further packets.
    let before = _net.total_sent();
    resolver
        .lookup_family("nodata.example", Family::Any)
        .await
        .unwrap();
    assert_eq!(_net.total_sent(), before);
}

fn net_all_nodata(net: &std::sync::Arc<MockNet>) {
    net.set_behavior(s1(), Behavior::respond(|q| nodata(q)));
}

#[tokio::test]
async fn reverse_lookup_builds_arpa_name() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![ptr_record(&q.name, 300, "example.com")])),
    );

    let names = resolver
        .reverse(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
        .await
        .unwrap();
    assert_eq!(names, vec!["example.com".to_string()]);

    let queries = net.queries_for(s1());
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].name, "34.216.184.93.in-addr.arpa");
    assert_eq!(queries[0].rtype, RecordType::PTR);
}

#[tokio::test]
async fn reverse_lookup_ipv6_uses_nibble_format() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![ptr_record(&q.name, 300, "v6.example.com")])),
    );

    let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let names = resolver.reverse(IpAddr::V6(ip)).await.unwrap();
    assert_eq!(names, vec!["v6.example.com".to_string()]);

    let queries = net.queries_for(s1());
    assert!(queries[0].name.ends_with(".ip6.arpa"));
    assert!(queries[0].name.starts_with("1.0.0.0."));
}

#[tokio::test]
async fn invalid_name_fails_before_any_wire_traffic() {
    let (resolver, net) = resolver_with(&[s1()]);

    let err = resolver.resolve4("bad..name").await.unwrap_err();
    assert!(matches!(err, ResolveError::InvalidArgument(_)));
    assert_eq!(net.total_sent(), 0);
}

#[tokio::test]
async fn resolve_single_fails_empty_when_no_records() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(s1(), Behavior::respond(|q| nodata(q)));

    let err = resolver
        .resolve_single("nodata.example", None, &[RecordType::A])
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Empty));
}

#[tokio::test]
async fn typed_lookups_extract_rdata() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::with(|q| {
            let response = match q.rtype {
                RecordType::MX => answer(q, vec![mx_record(&q.name, 300, 10, "mail.example.com")]),
                RecordType::SRV => answer(
                    q,
                    vec![srv_record(&q.name, 300, 5060, "sip.example.com")],
                ),
                RecordType::TXT => answer(q, vec![txt_record(&q.name, 300, &["v=spf1 -all"])]),
                RecordType::CNAME => {
                    answer(q, vec![cname_record(&q.name, 300, "canonical.example.com")])
                }
                RecordType::NS => answer(q, vec![ns_record(&q.name, 300, "ns1.example.com")]),
                RecordType::AAAA => answer(
                    q,
                    vec![aaaa_record(&q.name, 300, "2001:db8::1".parse().unwrap())],
                ),
                _ => nodata(q),
            };
            MockReply::Respond {
                response,
                delay: Duration::ZERO,
            }
        }),
    );

    let mx = resolver.resolve_mx("example.com").await.unwrap();
    assert_eq!(mx[0].preference, 10);
    assert_eq!(mx[0].exchange, "mail.example.com");

    let srv = resolver.resolve_srv("_sip._udp.example.com").await.unwrap();
    assert_eq!(srv[0].port, 5060);
    assert_eq!(srv[0].target, "sip.example.com");

    let txt = resolver.resolve_txt("example.com").await.unwrap();
    assert_eq!(txt[0], vec!["v=spf1 -all".to_string()]);

    let cname = resolver.resolve_cname("www.example.com").await.unwrap();
    assert_eq!(cname, vec!["canonical.example.com".to_string()]);

    let ns = resolver.resolve_ns("example.com").await.unwrap();
    assert_eq!(ns, vec!["ns1.example.com".to_string()]);

    let v6 = resolver.resolve6("example.com").await.unwrap();
    assert_eq!(v6, vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);
}

#[tokio::test]
async fn names_are_normalized_before_querying_and_caching() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![a_record(&q.name, 300, [1, 1, 1, 1])])),
    );

    resolver.resolve4("Example.COM.").await.unwrap();
    assert_eq!(net.queries_for(s1())[0].name, "example.com");

    // Differently-cased repeat is a cache hit.
    resolver.resolve4("EXAMPLE.com").await.unwrap();
    assert_eq!(net.sent_count(s1()), 1);
}

#[tokio::test]
async fn server_list_operations() {
    let (resolver, _net) = resolver_with(&[s1(), s2()]);

    assert_eq!(resolver.get_dns_server(0), Some(s1()));
    assert_eq!(resolver.get_dns_server(1), Some(s2()));
    assert_eq!(resolver.get_dns_server(2), None);

    assert!(resolver.add_dns_server(s3()));
    assert!(!resolver.add_dns_server(s3()));
    assert_eq!(resolver.get_dns_server(2), Some(s3()));

    assert!(resolver.remove_dns_server(s2()));
    assert!(!resolver.remove_dns_server(s2()));
    assert_eq!(resolver.get_dns_server(1), Some(s3()));
}

#[test]
fn blocking_validation_without_an_ambient_runtime() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![a_record(&q.name, 60, [1, 1, 1, 1])])),
    );

    assert!(resolver.validate_server_blocking(s1(), Duration::from_secs(2)));
    // The channel's read loop ran on the worker's throwaway runtime and
    // was retired with it; the next use reopens the channel.
    assert!(!resolver.pool().is_open(s1()));

    net.set_behavior(s2(), Behavior::fail_send());
    assert!(!resolver.validate_server_blocking(s2(), Duration::from_secs(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_validation_reuses_the_ambient_runtime() {
    let (resolver, net) = resolver_with(&[s1()]);
    net.set_behavior(
        s1(),
        Behavior::respond(|q| answer(q, vec![a_record(&q.name, 60, [1, 1, 1, 1])])),
    );

    let (ok, open) = tokio::task::spawn_blocking(move || {
        let ok = resolver.validate_server_blocking(s1(), Duration::from_secs(2));
        (ok, resolver.pool().is_open(s1()))
    })
    .await
    .unwrap();

    assert!(ok);
    // The channel lives on the ambient runtime and stays open.
    assert!(open);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_validates_system_servers() {
    let mut config = hugin::config::ResolverConfig::default();
    config.servers = vec![s1()];
    config.validate_servers = true;
    config.validation_canary = "canary.example".to_string();
    let (resolver, net) = resolver_with_config(config);

    // s2 answers the canary; s3 is unreachable.
    net.set_behavior(
        s2(),
        Behavior::respond(|q| answer(q, vec![a_record(&q.name, 300, [2, 2, 2, 2])])),
    );
    net.set_behavior(s3(), Behavior::black_hole());

    let provider = StaticNameservers(vec![
        "192.0.2.2".to_string(),
        "192.0.2.3".to_string(),
        "not an address".to_string(),
    ]);
    let added = resolver.apply_system_servers(&provider).await;

    assert_eq!(added, 1);
    assert_eq!(resolver.get_dns_server(1), Some(s2()));
    assert_eq!(resolver.pool().len(), 2);

    let canary_queries = net.queries_for(s2());
    assert_eq!(canary_queries[0].name, "canary.example");
}
