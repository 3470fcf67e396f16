mod balance;
mod clinical;
mod cluster;
mod crossval;
mod feature_selection;
mod fit_clustering;
mod fit_crossval;
mod fit_run;
mod forest;
mod metrics;
mod pipeline_common;
mod routines_pre_process;

use clap::{Parser, Subcommand};
use fit_clustering::*;
use fit_crossval::*;
use fit_run::*;
use pipeline_common::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "CAROB",
    long_about = "Classification of RNA-seq subtypes with Observational Benchmarking\n\
		  Expression input: genes x samples delimited text (.tsv/.csv, .gz ok).\n\
		  Clinical input: one row per sample with the standard annotation columns."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run the full pipeline in one batch pass",
        long_about = "Run the full pipeline in one batch pass:\n\
		      (1) Normalize the clinical table and filter the expression matrix\n\
		      (2) Select and scale highly variable genes\n\
		      (3) Embed and cluster the samples (QC branch)\n\
		      (4) Balance classes and cross-validate the subtype classifier\n"
    )]
    Run(RunArgs),

    #[command(
        about = "Embedding and clustering branch only",
        long_about = "Preprocess, embed the samples by PCA, and cluster them\n\
		      with k-means and Ward linkage at every tested k.\n"
    )]
    Cluster(ClusteringArgs),

    #[command(
        about = "Balanced cross-validation branch only",
        long_about = "Preprocess, balance the subtype classes by undersampling,\n\
		      run stratified K-fold cross-validation of the random\n\
		      forest classifier, and score a final model with feature\n\
		      importance on the held-out samples.\n"
    )]
    Crossval(CrossvalArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Run(args) => {
            run_pipeline(args)?;
        }
        Commands::Cluster(args) => {
            run_clustering(args)?;
        }
        Commands::Crossval(args) => {
            run_crossval(args)?;
        }
    }

    info!("Done");
    Ok(())
}
