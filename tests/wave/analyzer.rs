use std::time::Instant;

use coherence_gateway::{
    config::Config,
    wave::{CoherenceAnalyzer, WaveMetrics},
};

const CORPUS: &[&str] = &[
    "The river carries silt to the delta. Farmers plant rice in the flooded fields. \
     Harvest season brings migrant workers. The delta economy depends on the river.",
    "Rust ownership prevents data races. Borrowing lets functions read without moving. \
     Lifetimes tie references to scopes. The compiler checks every borrow.",
    "We shipped the release. The release broke login. We rolled back the release. \
     Login works again.",
    "Budgets grew. Teams hired. Budgets shrank. Teams merged. Nobody explained why.",
];

fn sentences(text: &str) -> Vec<String> {
    text.split('.')
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(|sentence| format!("{sentence}."))
        .collect()
}

#[test]
fn given_repeated_sentence_when_analyzing_then_curl_dominates_and_score_drops() {
    let metrics = CoherenceAnalyzer::default().analyze("The cat sat. The cat sat. The cat sat.");

    assert!((metrics.curl - 1.0).abs() < 1e-9, "curl was {}", metrics.curl);
    assert!(metrics.coherence_score < 50.0);
}

#[test]
fn given_empty_or_single_sentence_when_analyzing_then_metrics_are_trivial() {
    let analyzer = CoherenceAnalyzer::default();
    for text in ["", "   ", "One lonely sentence.", "...!?"] {
        assert_eq!(analyzer.analyze(text), WaveMetrics::TRIVIAL, "input {text:?}");
    }
}

#[test]
fn given_same_text_when_analyzed_twice_then_metrics_are_identical() {
    let analyzer = CoherenceAnalyzer::default();
    for text in CORPUS {
        assert_eq!(analyzer.analyze(text), analyzer.analyze(text));
    }
}

#[test]
fn given_any_sentence_duplicated_later_when_analyzing_then_score_never_rises() {
    let analyzer = CoherenceAnalyzer::default();

    for text in CORPUS {
        let original = sentences(text);
        let baseline = analyzer.analyze(&original.join(" ")).coherence_score;

        for (source, sentence) in original.iter().enumerate() {
            for position in (source + 1)..=original.len() {
                let mut duplicated = original.clone();
                duplicated.insert(position, sentence.clone());
                let score = analyzer.analyze(&duplicated.join(" ")).coherence_score;
                assert!(
                    score <= baseline + 1e-9,
                    "duplicating sentence {source} at {position} raised {baseline} to {score}: {text}"
                );
            }
        }
    }
}

#[test]
fn given_corpus_when_analyzing_then_every_metric_stays_in_range() {
    let analyzer = CoherenceAnalyzer::default();
    for text in CORPUS {
        let metrics = analyzer.analyze(text);
        for value in [metrics.curl, metrics.divergence, metrics.potential] {
            assert!((0.0..=1.0).contains(&value), "{metrics:?}");
        }
        assert!((0.0..=100.0).contains(&metrics.coherence_score), "{metrics:?}");
    }
}

fn fill_to(limit: usize, sentence: impl Fn(usize) -> String) -> String {
    let mut text = String::with_capacity(limit);
    for n in 0.. {
        let next = sentence(n);
        if text.len() + next.len() > limit {
            break;
        }
        text.push_str(&next);
    }
    text
}

#[test]
fn given_largest_accepted_input_when_analyzing_then_it_finishes_within_the_request_deadline() {
    let config = Config::default();
    let text = fill_to(config.wave.max_content_bytes, |n| format!("w{n}. "));
    assert!(text.len() > config.wave.max_content_bytes - 16);

    let started = Instant::now();
    let metrics = CoherenceAnalyzer::default().analyze(&text);
    let elapsed = started.elapsed();

    assert_eq!(metrics.curl, 0.0);
    assert!(
        elapsed < config.server.request_timeout(),
        "analysis took {elapsed:?}"
    );
}

#[test]
fn given_sentences_sharing_a_topic_word_when_analyzing_then_it_finishes_quickly() {
    let text = fill_to(64 * 1024, |n| format!("Topic item{n}. "));

    let started = Instant::now();
    let metrics = CoherenceAnalyzer::default().analyze(&text);
    let elapsed = started.elapsed();

    assert!(metrics.curl > 0.0 && metrics.curl < 1.0);
    assert!(
        elapsed < Config::default().server.request_timeout(),
        "analysis took {elapsed:?}"
    );
}
