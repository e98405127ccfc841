use akashi_benchmarks::{io, markdown, run_all_benchmarks};
use std::path::Path;

/// CLI to run all benchmarks and save results
fn main() {
    println!("Akashi - Benchmark Runner");
    println!("=========================\n");

    let results = run_all_benchmarks();

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let raw_json_path =
        Path::new("benchmarks/output/raw").join(format!("results_{}.json", timestamp));
    let summary_md_path = Path::new("benchmarks/output").join(format!("report_{}.md", timestamp));

    match io::write_results_json(&results, &raw_json_path) {
        Ok(_) => println!("Saved raw results to: {}", raw_json_path.display()),
        Err(e) => eprintln!("Failed to save raw results: {}", e),
    }

    let report = markdown::generate_report(&results);
    match io::write_markdown(&report, &summary_md_path) {
        Ok(_) => println!("Saved markdown report to: {}", summary_md_path.display()),
        Err(e) => eprintln!("Failed to save markdown report: {}", e),
    }

    println!("\n{}", markdown::generate_summary(&results));
}
