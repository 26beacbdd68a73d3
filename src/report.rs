use std::fmt::Write;

use chrono::{DateTime, Local};

use crate::extract::title_case;
use crate::models::{AggregatedStats, UnitCount, RATING_FIELDS};

/// Units ordered by record count, largest first; ties by unit id.
pub fn rank_units(stats: &AggregatedStats) -> Vec<(&str, &UnitCount)> {
    let mut ranked: Vec<(&str, &UnitCount)> = stats
        .by_unit
        .iter()
        .map(|(id, count)| (id.as_str(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));
    ranked
}

pub fn build_report(stats: &AggregatedStats, generated_at: DateTime<Local>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Division Records Report");
    let _ = writeln!(
        output,
        "Generated {} across {} records",
        generated_at.format("%Y-%m-%d %H:%M"),
        stats.total
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Records by Unit");

    if stats.by_unit.is_empty() {
        let _ = writeln!(output, "No units could be loaded.");
    } else {
        for (id, unit) in rank_units(stats) {
            let _ = writeln!(output, "- {} (`{}`): {} records", unit.label, id, unit.count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Records by Month");

    if stats.by_month.is_empty() {
        let _ = writeln!(output, "No dated records.");
    } else {
        for (month, count) in stats.by_month.iter().rev() {
            let _ = writeln!(output, "- {month}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Records by Province");

    if stats.by_province.is_empty() {
        let _ = writeln!(output, "No records with a recognised province.");
    } else {
        let mut provinces: Vec<_> = stats.by_province.iter().collect();
        provinces.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (province, count) in provinces {
            let _ = writeln!(output, "- {province}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Client Satisfaction");

    if stats.unit_ratings.is_empty() {
        let _ = writeln!(output, "No rated records.");
    } else {
        for (id, ratings) in &stats.unit_ratings {
            let label = stats
                .by_unit
                .get(id)
                .map(|unit| unit.label.as_str())
                .unwrap_or(id.as_str());
            let _ = writeln!(
                output,
                "### {label}\nOverall {:.2} from {} of {} records",
                ratings.overall_avg, ratings.rated_count, ratings.total_records
            );
            for field in RATING_FIELDS {
                let average = ratings
                    .averages
                    .get(field)
                    .and_then(|average| average.as_deref())
                    .unwrap_or("n/a");
                let _ = writeln!(output, "- {}: {average}", title_case(field));
            }
            let histogram: Vec<String> = ratings
                .by_score
                .iter()
                .map(|(score, count)| format!("{score}★ {count}"))
                .collect();
            let _ = writeln!(output, "- Scores: {}", histogram.join(", "));
        }
    }

    output
}
